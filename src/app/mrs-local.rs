use anyhow::{Context, Result};
use clap::Parser;
use mrstream::cmd::local::Args;
use mrstream::streaming::protocol::format_line;
use mrstream::*;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{info, warn};

/// Stream reduce output to `out` as lines.
async fn write_run<W>(mut run: Run, out: W) -> Result<RunSummary>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BufWriter::new(out);
    while let Some(kv) = run.recv().await {
        out.write_all(&format_line(&kv)).await?;
    }
    out.flush().await?;
    Ok(run.wait().await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing(args.verbose);

    let config = args.engine_config()?;
    let app = workload::named(&args.workload)?;
    let driver = args.driver().await?;
    let run = Engine::new(config).run(app, driver)?;

    let cancel = run.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let summary = if let Some(path) = args.parquet_output() {
        let (records, summary) = run.collect().await?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || sink::write_parquet(&path, &records))
            .await?
            .context("writing parquet output")?;
        summary
    } else if let Some(path) = &args.output {
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        write_run(run, file).await?
    } else {
        write_run(run, tokio::io::stdout()).await?
    };

    info!(
        run_id = %summary.run_id,
        jobs = summary.jobs,
        values = summary.values,
        "done"
    );
    for (group, counter, amount) in summary.counters.iter() {
        info!("{group}/{counter} = {amount}");
    }
    Ok(())
}
