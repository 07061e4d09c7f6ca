use std::fs::File;
use std::io::{self, BufRead, BufReader};

use clap::Parser;
use tracing::{info, warn};

use harlog::capture::CaptureController;
use harlog::config::{CaptureConfig, CliArgs};
use harlog::model::FlowSnapshot;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let input = args.input.clone();
    let config = CaptureConfig::try_from(args)?;

    let controller = CaptureController::new();
    controller.configure(&config)?;

    let stats = match &input {
        Some(path) => {
            info!(path = %path.display(), "reading flow snapshots");
            replay_snapshots(&controller, BufReader::new(File::open(path)?))?
        }
        None => {
            info!("reading flow snapshots from stdin");
            replay_snapshots(&controller, io::stdin().lock())?
        }
    };

    controller.shutdown().await?;
    info!(
        captured = stats.captured,
        skipped = stats.skipped,
        output = %config.output.display(),
        "capture complete"
    );
    Ok(())
}

#[derive(Default)]
struct ReplayStats {
    captured: u64,
    skipped: u64,
}

/// Feed one FlowSnapshot per input line through the capture pipeline.
/// Unparseable lines are skipped with a warning; per-flow capture failures
/// are contained by the controller itself.
fn replay_snapshots(
    controller: &CaptureController,
    reader: impl BufRead,
) -> anyhow::Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FlowSnapshot>(&line) {
            Ok(snapshot) => {
                controller.on_flow_completed(snapshot);
                stats.captured += 1;
            }
            Err(e) => {
                warn!(line = line_no + 1, "skipping unparseable snapshot: {e}");
                stats.skipped += 1;
            }
        }
    }
    Ok(stats)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harlog=info".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
