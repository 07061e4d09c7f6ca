use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::writer::Durability;

const DEFAULT_BATCH_LINES: usize = 64;
const MAX_BATCH_LINES: usize = 100_000;
const MAX_QUEUE_CAPACITY: usize = 1_000_000;

/// Convert proxy-engine flow snapshots (JSON Lines) into a HAR-like capture
/// log, one durable JSON object per line.
#[derive(Debug, Clone, Parser)]
#[command(name = "harlog", version, about, long_about = None)]
pub struct CliArgs {
    /// Capture log to append records to (created if absent).
    #[arg(long, env = "HARLOG_OUTPUT")]
    pub output: PathBuf,

    /// Flow snapshot JSONL to read. Reads stdin when omitted.
    #[arg(long, env = "HARLOG_INPUT")]
    pub input: Option<PathBuf>,

    /// Durability policy for the capture log.
    #[arg(long, env = "HARLOG_DURABILITY", value_enum, default_value = "flush-each")]
    pub durability: DurabilityArg,

    /// Lines per fsync batch (batched durability only).
    #[arg(long, env = "HARLOG_BATCH_LINES", default_value_t = DEFAULT_BATCH_LINES)]
    pub batch_lines: usize,

    /// Bounded in-memory record queue size. 0 appends directly from the
    /// capture hook.
    #[arg(long, env = "HARLOG_QUEUE_CAPACITY", default_value_t = 0)]
    pub queue_capacity: usize,

    /// What to do when the record queue is full.
    #[arg(long, env = "HARLOG_QUEUE_POLICY", value_enum, default_value = "block")]
    pub queue_policy: OverflowPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DurabilityArg {
    /// fsync after every record.
    FlushEach,
    /// fsync once per batch of records.
    Batched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Wait until the drain task frees a slot.
    Block,
    /// Evict the oldest queued record and count the drop.
    DropOldest,
}

/// How completed flows reach the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Append inline from the capture hook; the caller is blocked only for
    /// the writer critical section.
    Direct,
    /// Hand off to a bounded queue drained by a background task.
    Queued {
        capacity: usize,
        policy: OverflowPolicy,
    },
}

/// Validated capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub output: PathBuf,
    pub durability: Durability,
    pub queue: QueueMode,
}

impl CaptureConfig {
    /// Defaults for library embedding: flush every write, direct dispatch.
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            durability: Durability::FlushEachWrite,
            queue: QueueMode::Direct,
        }
    }
}

impl TryFrom<CliArgs> for CaptureConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        anyhow::ensure!(
            !args.output.as_os_str().is_empty(),
            "output path must not be empty"
        );
        anyhow::ensure!(
            args.batch_lines >= 1 && args.batch_lines <= MAX_BATCH_LINES,
            "batch-lines must be in 1..={MAX_BATCH_LINES}"
        );
        anyhow::ensure!(
            args.queue_capacity <= MAX_QUEUE_CAPACITY,
            "queue-capacity must be <= {MAX_QUEUE_CAPACITY}"
        );

        let durability = match args.durability {
            DurabilityArg::FlushEach => Durability::FlushEachWrite,
            DurabilityArg::Batched => Durability::Batched {
                max_buffered: args.batch_lines,
            },
        };
        let queue = if args.queue_capacity == 0 {
            QueueMode::Direct
        } else {
            QueueMode::Queued {
                capacity: args.queue_capacity,
                policy: args.queue_policy,
            }
        };

        Ok(Self {
            output: args.output,
            durability,
            queue,
        })
    }
}
