#![deny(clippy::all, clippy::pedantic)]

use std::path::PathBuf;
use std::time::Instant;

use futures::future::join_all;

use crate::args::BenchArgs;
use crate::client::{CliError, Ctx, RenderReply};
use crate::io::{load_job, write_output};
use crate::print::render_summary;

#[derive(Debug, Default, PartialEq)]
pub struct BenchSummary {
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
    pub slowest: Option<f64>,
}

impl BenchSummary {
    fn record(&mut self, reply: &RenderReply) {
        self.succeeded += 1;
        if reply.cached {
            self.cached += 1;
        }
        if let Some(took) = reply.took {
            self.slowest = Some(self.slowest.map_or(took, |slowest| slowest.max(took)));
        }
    }
}

pub async fn handle(ctx: &Ctx, cmd: BenchArgs) -> Result<(), CliError> {
    if cmd.jobs == 0 {
        return Err(CliError::InvalidInput("--jobs must be at least 1".into()));
    }
    let template = load_job(&cmd.source)?;
    let output_dir = cmd.output_dir.unwrap_or_else(std::env::temp_dir);
    let extension = template.render.format.as_str();

    let started = Instant::now();
    let requests = (0..cmd.jobs).map(|client| {
        let job = template.clone().with_priority(client.try_into().unwrap_or(i32::MAX));
        let path = output_dir.join(format!("video-{client}.{extension}"));
        async move {
            let reply = ctx.render(&job).await;
            (client, path, reply)
        }
    });

    let mut summary = BenchSummary::default();
    for (client, path, reply) in join_all(requests).await {
        match reply.and_then(|reply| save(path, reply)) {
            Ok((reply, path)) => {
                println!("[client {client}] {}", render_summary(&reply, &path));
                summary.record(&reply);
            }
            Err(err) => {
                eprintln!("[client {client}] failed: {err}");
                summary.failed += 1;
            }
        }
    }

    println!(
        "{} ok ({} cached), {} failed, slowest {}, wall {:.2}s",
        summary.succeeded,
        summary.cached,
        summary.failed,
        summary
            .slowest
            .map_or_else(|| "?".to_string(), |took| format!("{took:.2}s")),
        started.elapsed().as_secs_f64()
    );

    if summary.failed > 0 {
        return Err(CliError::InvalidInput(format!(
            "{} of {} requests failed",
            summary.failed, cmd.jobs
        )));
    }
    Ok(())
}

fn save(path: PathBuf, reply: RenderReply) -> Result<(RenderReply, PathBuf), CliError> {
    write_output(&path, &reply.bytes)?;
    Ok((reply, path))
}
