//! `jobstream-tail` -- follow a job's event stream in the terminal.
//!
//! ```text
//! jobstream-tail <job-id>
//! jobstream-tail --submit <request.json>
//! ```
//!
//! Revealed text goes to stdout; logs and the latency report go to stderr.
//! Ctrl-C cancels the run.
//!
//! # Environment variables
//!
//! See `ClientConfig::from_env` for the full table. `JOBSTREAM_API_URL`
//! is required.

use std::sync::Arc;

use anyhow::{bail, Context};
use jobstream_client::{ClientConfig, JobsApi, PipelineConfig, RunPipeline, UiUpdate};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: jobstream-tail <job-id> | --submit <request.json>";

enum Target {
    Attach(String),
    Submit(String),
}

impl Target {
    fn from_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let target = match (args.next(), args.next()) {
            (Some(flag), Some(path)) if flag == "--submit" => Self::Submit(path),
            (Some(job_id), None) if !job_id.starts_with('-') => Self::Attach(job_id),
            _ => bail!(USAGE),
        };
        if args.next().is_some() {
            bail!(USAGE);
        }
        Ok(target)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobstream_tail=info,jobstream_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let target = Target::from_args(std::env::args().skip(1))?;
    let config = ClientConfig::from_env().context("Failed to load client configuration")?;

    let api = Arc::new(JobsApi::new(config.api_url.clone(), config.api_token.clone()));
    let pipeline = RunPipeline::new(api, PipelineConfig::from(&config));

    let mut handle = match target {
        Target::Attach(job_id) => pipeline.attach(job_id),
        Target::Submit(path) => {
            let body = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {path}"))?;
            let request: serde_json::Value = serde_json::from_str(&body)
                .with_context(|| format!("{path} is not valid JSON"))?;
            pipeline
                .submit(&request)
                .await
                .context("Failed to submit job")?
        }
    };
    tracing::info!(job_id = %handle.job_id(), "Following job");

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut failure = None;
    while let Some(update) = handle.next_update().await {
        match update {
            UiUpdate::Reveal(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            UiUpdate::Phase(phase) => tracing::debug!(?phase, "Connection phase changed"),
            UiUpdate::Step(event) => {
                tracing::trace!(step_id = %event.step_id, finished = event.finished, "Step");
            }
            UiUpdate::Finished { status, latency } => {
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
                eprintln!("job {} {status}", handle.job_id());
                eprintln!("{latency}");
            }
            UiUpdate::Errored { message, latency } => {
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
                eprintln!("{latency}");
                failure = Some(message);
            }
        }
    }

    if let Some(message) = failure {
        bail!(message);
    }
    Ok(())
}
