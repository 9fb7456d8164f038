#![deny(clippy::all, clippy::pedantic)]

use crate::client::{CliError, Ctx};
use crate::print::print_json;

pub async fn handle(ctx: &Ctx) -> Result<(), CliError> {
    let report = ctx.health().await?;
    print_json(&report)
}
