use anyhow::{Context, Result};
use clap::Parser;
use mrstream::cmd::stream::{Args, Commands, Step};
use mrstream::streaming::{Input, StreamSummary, Streaming};
use mrstream::*;
use tokio::io::AsyncWrite;
use tracing::info;

async fn run_step<W>(
    streaming: &Streaming,
    map: bool,
    app: Workload,
    input: &Input,
    output: W,
) -> mrstream::Result<StreamSummary>
where
    W: AsyncWrite + Unpin,
{
    let diagnostics = tokio::io::stderr();
    if map {
        streaming.map(app.map_fn, input, output, diagnostics).await
    } else {
        streaming.reduce(app.reduce_fn, input, output, diagnostics).await
    }
}

async fn run(step: Step, map: bool, config_file: Option<&std::path::Path>) -> Result<StreamSummary> {
    let config = step.streaming_config(config_file)?;
    let app = workload::named(&step.workload)?;
    let input = step.input()?;
    let streaming = Streaming::new(config, step.fetcher().await);

    let summary = match &step.output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            run_step(&streaming, map, app, &input, file).await?
        }
        None => run_step(&streaming, map, app, &input, tokio::io::stdout()).await?,
    };
    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing(args.verbose);

    let (step, map) = match args.command {
        Commands::Map(step) => (step, true),
        Commands::Reduce(step) => (step, false),
    };
    let summary = run(step, map, args.config.as_deref()).await?;
    info!(
        records = summary.records,
        jobs = summary.jobs,
        written = summary.written,
        "step finished"
    );
    Ok(())
}
