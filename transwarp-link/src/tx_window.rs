//! Transmit-side sliding window: capacity admission, ack release, and the
//! retransmitter task.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{Error, Result};
use crate::trace::{TraceRecord, TraceSink};

#[derive(Debug)]
struct TxEntry {
    /// Encoded datagram; retransmission re-emits these exact bytes.
    datagram: Bytes,
    admitted_at: Instant,
    next_retransmit_at: Instant,
    retries: u32,
}

#[derive(Debug)]
pub struct TxWindow {
    entries: Mutex<BTreeMap<i32, TxEntry>>,
    /// Admission capacity. Closing it is the shutdown signal for senders
    /// blocked on a full window.
    capacity: Semaphore,
    /// Wakes the retransmitter after an admission.
    armed: Notify,
    retransmit_delay: Duration,
    window_capacity: usize,
}

impl TxWindow {
    pub fn new(window_capacity: usize, retransmit_delay: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity: Semaphore::new(window_capacity),
            armed: Notify::new(),
            retransmit_delay,
            window_capacity,
        }
    }

    /// Admit one sequenced frame, waiting cooperatively for capacity. The
    /// retransmit deadline is armed before the first transmission hits the
    /// socket, so cancellation by ack can never miss a timer.
    pub async fn admit(&self, sequence: i32, datagram: Bytes) -> Result<()> {
        let permit = self
            .capacity
            .acquire()
            .await
            .map_err(|_| Error::LinkClosed)?;
        permit.forget();

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            sequence,
            TxEntry {
                datagram,
                admitted_at: now,
                next_retransmit_at: now + self.retransmit_delay,
                retries: 0,
            },
        );
        drop(entries);
        self.armed.notify_one();
        Ok(())
    }

    /// Release the entry for an acked sequence, returning its capacity and
    /// cancelling its retransmit deadline. Returns false for unknown
    /// sequences (repeated acks), which callers log and ignore.
    pub fn ack(&self, for_sequence: i32, advertised_window: i32) -> bool {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&for_sequence)
        };
        match removed {
            Some(entry) => {
                self.capacity.add_permits(1);
                trace!(
                    target: "transwarp::tx_window",
                    for_sequence,
                    advertised_window,
                    retries = entry.retries,
                    in_flight_ms = entry.admitted_at.elapsed().as_millis() as u64,
                );
                true
            }
            None => false,
        }
    }

    /// Unacknowledged sequences, ascending.
    pub fn keys(&self) -> Vec<i32> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity currently available for admission.
    pub fn available_capacity(&self) -> usize {
        self.capacity.available_permits()
    }

    pub fn window_capacity(&self) -> usize {
        self.window_capacity
    }

    /// Wake blocked senders with `LinkClosed` and stop admitting.
    pub fn close(&self) {
        self.capacity.close();
        self.armed.notify_one();
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.next_retransmit_at)
            .min()
    }

    /// Collect entries whose deadline has passed, re-arming each. An entry
    /// acked between deadline computation and this call is simply absent:
    /// cancellation and fire are serialized by the window lock.
    fn take_due(&self, now: Instant) -> Vec<(i32, u32, Bytes)> {
        let mut entries = self.entries.lock().unwrap();
        let mut due = Vec::new();
        for (&sequence, entry) in entries.iter_mut() {
            if entry.next_retransmit_at <= now {
                entry.retries += 1;
                entry.next_retransmit_at = now + self.retransmit_delay;
                due.push((sequence, entry.retries, entry.datagram.clone()));
            }
        }
        due
    }

    /// Retransmitter: sleep until the earliest deadline, re-emit whatever is
    /// still unacked, repeat. There is no retry cap; a dead link is the
    /// pinger's call.
    pub async fn run_retransmitter(
        &self,
        outbound: mpsc::Sender<Bytes>,
        sink: TraceSink,
        shutdown: CancellationToken,
    ) {
        loop {
            match self.earliest_deadline() {
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = self.armed.notified() => {}
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep_until(deadline) => {
                            for (sequence, retries, datagram) in self.take_due(Instant::now()) {
                                debug!(target: "transwarp::tx_window", sequence, retries, "retransmit");
                                sink.emit(TraceRecord::Tx { sequence, retransmit: true });
                                if outbound.send(datagram).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
