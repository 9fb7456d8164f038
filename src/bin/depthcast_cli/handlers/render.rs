#![deny(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use crate::args::RenderArgs;
use crate::client::{CliError, Ctx};
use crate::io::{load_job, write_output};
use crate::print::render_summary;

pub async fn handle(ctx: &Ctx, cmd: RenderArgs) -> Result<(), CliError> {
    let mut job = load_job(&cmd.source)?;
    if let Some(priority) = cmd.priority {
        job.priority = priority;
    }
    if let Some(expire) = cmd.expire {
        job.expire = expire;
    }

    let output = cmd
        .output
        .unwrap_or_else(|| PathBuf::from(format!("video.{}", job.render.format)));

    let reply = ctx.render(&job).await?;
    write_output(&output, &reply.bytes)?;
    println!("{}", render_summary(&reply, &output));
    Ok(())
}
