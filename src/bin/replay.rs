// =============================================================================
// Orca Replay — offline CSV evaluation of the detection pipeline
// =============================================================================
//
// Usage:
//   orca-replay <trades.csv> [--speed N]
//
// `--speed 0` (default) replays flat out; `--speed 1` paces events at their
// recorded spacing; larger values accelerate proportionally.  The pipeline
// and configuration are identical to the live supervisor, so a recorded
// stream reproduces the same alerts on every run.
// =============================================================================

use tracing::info;
use tracing_subscriber::EnvFilter;

use orca_watch::config::MonitorConfig;
use orca_watch::replay::{load_csv, ReplayEngine};

fn usage() -> ! {
    eprintln!("usage: orca-replay <trades.csv> [--speed N]");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut path: Option<String> = None;
    let mut speed = 0.0f64;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--speed" => {
                speed = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            "--help" | "-h" => usage(),
            other if path.is_none() => path = Some(other.to_string()),
            _ => usage(),
        }
    }
    let path = path.unwrap_or_else(|| usage());

    let config = MonitorConfig::load(None)?;
    let (events, skipped) = load_csv(&path)?;
    if events.is_empty() {
        anyhow::bail!("no usable rows in {path}");
    }
    info!(count = events.len(), speed, "starting replay");

    let engine = ReplayEngine::new(config)?;
    let mut summary = engine.run(&events, speed).await?;
    summary.skipped_rows += skipped;

    println!("{}", summary.render());
    Ok(())
}
