//! # gluco-replay
//!
//! Replays a capture of CGM transmitter notifications and finger-stick
//! events through the gluco core and prints the resulting readings and
//! calibrations as JSON lines.
//!
//! A reader task parses the capture and feeds events through a bounded
//! channel to a single processing task that owns all history, the way a
//! host app would serialize BLE callbacks onto one queue.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package gluco-replay -- capture.jsonl
//!
//! # Production logging, explicit configuration
//! ./gluco-replay --production --config /etc/gluco/config.toml capture.jsonl
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gluco_core::CoreConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

mod event;
mod logging;
mod session;

use event::ReplayEvent;
use session::{ReplayStats, Session};

/// Events buffered between the reader and the processing task.
const CHANNEL_CAPACITY: usize = 256;

/// Replay a CGM capture through the calibration core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON-lines capture to replay
    input: PathBuf,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "GLUCO_CONFIG")]
    config: Option<PathBuf>,

    /// JSON logs to a rolling file in addition to stderr
    #[arg(long)]
    production: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.production)?;

    let config = match &args.config {
        Some(path) => CoreConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => CoreConfig::load().context("Failed to load configuration")?,
    };
    info!(
        input = %args.input.display(),
        calibrator = ?config.transmitter.calibrator,
        "Starting replay"
    );

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_events(args.input, tx));
    let processor = tokio::spawn(process_events(rx, Session::new(&config)));

    let skipped = reader.await.context("Reader task panicked")??;
    let stats = processor.await.context("Processing task panicked")??;

    info!(
        events = stats.events,
        skipped_lines = skipped,
        rejected_packets = stats.rejected_packets,
        readings = stats.readings,
        calibrations = stats.calibrations,
        "Replay finished"
    );
    Ok(())
}

/// Parses the capture line by line and sends each event to the processor.
/// Returns the number of lines that could not be parsed.
async fn read_events(path: PathBuf, tx: mpsc::Sender<ReplayEvent>) -> anyhow::Result<usize> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("Failed to open capture {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_number = 0_usize;
    let mut skipped = 0_usize;

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read capture {}", path.display()))?
    {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match ReplayEvent::parse(&line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    warn!("Processing task stopped, ending read");
                    break;
                }
            }
            Err(e) => {
                skipped += 1;
                warn!(line = line_number, error = %e, "Skipping capture line");
            }
        }
    }
    Ok(skipped)
}

/// Applies events in arrival order and writes every record as a JSON line
/// to stdout.
async fn process_events(
    mut rx: mpsc::Receiver<ReplayEvent>,
    mut session: Session,
) -> anyhow::Result<ReplayStats> {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        let at = event.at();
        let records = match session.handle(event) {
            Ok(records) => records,
            Err(e) => {
                warn!(%at, error = %e, "Skipping event");
                continue;
            }
        };
        for record in records {
            let mut line = serde_json::to_vec(&record).context("Failed to encode record")?;
            line.push(b'\n');
            stdout
                .write_all(&line)
                .await
                .context("Failed to write to stdout")?;
        }
    }
    stdout.flush().await.context("Failed to flush stdout")?;
    Ok(session.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_read_events_skips_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"kind":"sensor_start","at":"2024-03-01T08:00:00Z"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(
            file,
            r#"{{"kind":"calibration","at":"2024-03-01T08:06:00Z","bg":120.0}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let skipped = read_events(file.path().to_path_buf(), tx).await.unwrap();
        assert_eq!(skipped, 1);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ReplayEvent::SensorStart { .. }));
        assert!(matches!(events[1], ReplayEvent::Calibration { bg, .. } if bg == 120.0));
    }

    #[tokio::test]
    async fn test_read_events_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        assert!(read_events(dir.path().join("missing.jsonl"), tx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_process_events_counts_every_event() {
        let (tx, rx) = mpsc::channel(4);
        let at = "2024-03-01T08:00:00Z".parse().unwrap();
        tx.send(ReplayEvent::SensorStart { at }).await.unwrap();
        tx.send(ReplayEvent::Packet {
            at,
            hex: "zz".into(),
        })
        .await
        .unwrap();
        drop(tx);

        let stats = process_events(rx, Session::new(&CoreConfig::default()))
            .await
            .unwrap();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.readings, 0);
    }
}
