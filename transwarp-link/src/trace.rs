//! Per-link structured trace stream.
//!
//! Window and frame events are pushed onto a bounded channel and written as
//! timestamped lines to `<token>-<suffix>.twtrace` by a single consumer.
//! Emission never blocks the data path; records beyond the channel depth are
//! dropped and counted.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    RxWindow { keys: Vec<i32>, high_water: i32 },
    TxWindow { keys: Vec<i32>, capacity: usize },
    Tx { sequence: i32, retransmit: bool },
    Rx { sequence: i32, discard: bool },
    TxAck { for_sequence: i32 },
    RxAck { for_sequence: i32 },
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceRecord::RxWindow { keys, high_water } => {
                write!(f, "rx_window{{keys{keys:?}, high_water[{high_water}]}}")
            }
            TraceRecord::TxWindow { keys, capacity } => {
                write!(f, "tx_window{{keys{keys:?}, capacity[{capacity}]}}")
            }
            TraceRecord::Tx {
                sequence,
                retransmit,
            } => write!(f, "tx{{sequence[{sequence}], retransmit[{retransmit}]}}"),
            TraceRecord::Rx { sequence, discard } => {
                write!(f, "rx{{sequence[{sequence}], discard[{discard}]}}")
            }
            TraceRecord::TxAck { for_sequence } => {
                write!(f, "tx_ack{{for_sequence[{for_sequence}]}}")
            }
            TraceRecord::RxAck { for_sequence } => {
                write!(f, "rx_ack{{for_sequence[{for_sequence}]}}")
            }
        }
    }
}

/// Cheap handle for producers. Cloning shares the channel and the overrun
/// counter.
#[derive(Clone)]
pub struct TraceSink {
    tx: Option<mpsc::Sender<TraceRecord>>,
    overruns: Arc<AtomicU64>,
}

impl TraceSink {
    /// No-op sink for links running with tracing disabled.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the consumer writing to `<token>-<suffix>.twtrace` under `dir`
    /// (working directory when `None`).
    pub fn spawn(
        token: &str,
        dir: Option<PathBuf>,
        depth: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let suffix: u32 = rand::random();
        let mut path = dir.unwrap_or_default();
        path.push(format!("{token}-{suffix:08x}.twtrace"));
        tokio::spawn(run_consumer(path, rx, shutdown));
        Self {
            tx: Some(tx),
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, record: TraceRecord) {
        let Some(tx) = &self.tx else { return };
        if let Err(mpsc::error::TrySendError::Full(record)) = tx.try_send(record) {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            debug!(target: "transwarp::trace", %record, "trace overrun");
        }
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

async fn run_consumer(
    path: PathBuf,
    mut rx: mpsc::Receiver<TraceRecord>,
    shutdown: CancellationToken,
) {
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(target: "transwarp::trace", path = %path.display(), "trace file create failed: {e}");
            return;
        }
    };
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        let line = format!("{}: {}\n", unix_ms(), record);
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(target: "transwarp::trace", path = %path.display(), "trace write failed: {e}");
            return;
        }
    }
    let _ = file.flush().await;
}

fn unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_render_compactly() {
        let record = TraceRecord::RxWindow {
            keys: vec![4, 6],
            high_water: 2,
        };
        assert_eq!(record.to_string(), "rx_window{keys[4, 6], high_water[2]}");
        assert_eq!(
            TraceRecord::Tx {
                sequence: 9,
                retransmit: true
            }
            .to_string(),
            "tx{sequence[9], retransmit[true]}"
        );
        assert_eq!(
            TraceRecord::TxAck { for_sequence: 3 }.to_string(),
            "tx_ack{for_sequence[3]}"
        );
    }

    #[tokio::test]
    async fn consumer_writes_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let sink = TraceSink::spawn(
            "router-9",
            Some(dir.path().to_path_buf()),
            16,
            shutdown.clone(),
        );
        sink.emit(TraceRecord::TxAck { for_sequence: 7 });
        sink.emit(TraceRecord::Rx {
            sequence: 7,
            discard: false,
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown.cancel();

        let entry = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let name = entry.file_name().into_string().unwrap();
        assert!(name.starts_with("router-9-") && name.ends_with(".twtrace"));
        let content = std::fs::read_to_string(entry.path()).unwrap();
        let mut lines = content.lines();
        let first = lines.next().unwrap();
        let (stamp, rest) = first.split_once(": ").unwrap();
        assert!(stamp.parse::<u128>().is_ok());
        assert_eq!(rest, "tx_ack{for_sequence[7]}");
        assert!(lines.next().unwrap().ends_with("rx{sequence[7], discard[false]}"));
    }

    #[tokio::test]
    async fn overrun_counted_not_blocking() {
        // No consumer drain: depth 1 fills after the first record.
        let (tx, _rx) = mpsc::channel(1);
        let sink = TraceSink {
            tx: Some(tx),
            overruns: Arc::new(AtomicU64::new(0)),
        };
        sink.emit(TraceRecord::TxAck { for_sequence: 0 });
        sink.emit(TraceRecord::TxAck { for_sequence: 1 });
        sink.emit(TraceRecord::TxAck { for_sequence: 2 });
        assert_eq!(sink.overruns(), 2);
    }
}
