//! Receive-side reorder buffer with gap detection and cumulative release.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::trace;

use transwarp_wire::Frame;

/// Ack to be emitted for a received sequenced frame. Returned by value so
/// the receive loop owns the emission path; the window holds no link
/// back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRequest {
    pub for_sequence: i32,
    pub advertised_window: i32,
}

/// Result of feeding one sequenced frame through the window.
#[derive(Debug)]
pub struct RxOutcome {
    /// Frames now releasable upward, in sequence order.
    pub ready: Vec<Frame>,
    /// Emitted unconditionally, once per receipt, duplicates included.
    pub ack: AckRequest,
    /// The frame was a duplicate or below the watermark and was not buffered.
    pub discarded: bool,
}

#[derive(Debug)]
struct RxInner {
    entries: BTreeMap<i32, Frame>,
    high_water: i32,
}

#[derive(Debug)]
pub struct RxWindow {
    inner: Mutex<RxInner>,
    capacity: usize,
}

impl RxWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RxInner {
                entries: BTreeMap::new(),
                high_water: -1,
            }),
            capacity,
        }
    }

    /// Buffer one sequenced frame. Frames at or below the watermark are
    /// discarded but still acknowledged; the contiguous run above the
    /// watermark is drained into `ready`.
    pub fn receive(&self, frame: Frame) -> RxOutcome {
        let mut inner = self.inner.lock().unwrap();
        let sequence = frame.sequence;

        let discarded = sequence <= inner.high_water || inner.entries.contains_key(&sequence);
        if !discarded {
            inner.entries.insert(sequence, frame);
        }

        let ack = AckRequest {
            for_sequence: sequence,
            advertised_window: self.capacity as i32 - inner.entries.len() as i32,
        };

        let mut ready = Vec::new();
        let mut next = inner.high_water + 1;
        while let Some(frame) = inner.entries.remove(&next) {
            ready.push(frame);
            inner.high_water = next;
            next += 1;
        }

        trace!(target: "transwarp::rx_window", sequence, discarded, released = ready.len(), high_water = inner.high_water);
        RxOutcome {
            ready,
            ack,
            discarded,
        }
    }

    /// Highest sequence released upward, contiguously.
    pub fn high_water(&self) -> i32 {
        self.inner.lock().unwrap().high_water
    }

    /// Remaining buffer capacity, as advertised to the peer.
    pub fn advertised_capacity(&self) -> i32 {
        let inner = self.inner.lock().unwrap();
        self.capacity as i32 - inner.entries.len() as i32
    }

    /// Sequences currently buffered behind a gap.
    pub fn keys(&self) -> Vec<i32> {
        self.inner.lock().unwrap().entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transwarp_wire::MessageType;

    fn frame(sequence: i32) -> Frame {
        Frame::sequenced(MessageType::Payload, sequence, vec![sequence as u8])
    }

    #[test]
    fn in_order_release() {
        let window = RxWindow::new(32);
        for sequence in 0..5 {
            let outcome = window.receive(frame(sequence));
            assert!(!outcome.discarded);
            assert_eq!(outcome.ack.for_sequence, sequence);
            let released: Vec<i32> = outcome.ready.iter().map(|f| f.sequence).collect();
            assert_eq!(released, vec![sequence]);
        }
        assert_eq!(window.high_water(), 4);
        assert!(window.keys().is_empty());
    }

    #[test]
    fn gap_holds_later_frames_until_filled() {
        let window = RxWindow::new(32);
        assert_eq!(window.receive(frame(0)).ready.len(), 1);
        assert!(window.receive(frame(2)).ready.is_empty());
        assert!(window.receive(frame(3)).ready.is_empty());
        assert_eq!(window.keys(), vec![2, 3]);

        let outcome = window.receive(frame(1));
        let released: Vec<i32> = outcome.ready.iter().map(|f| f.sequence).collect();
        assert_eq!(released, vec![1, 2, 3]);
        assert_eq!(window.high_water(), 3);
    }

    #[test]
    fn single_reorder_releases_pair() {
        // Arrival 0, 2, 1: the rx call for 1 releases exactly [1, 2].
        let window = RxWindow::new(32);
        window.receive(frame(0));
        window.receive(frame(2));
        let outcome = window.receive(frame(1));
        let released: Vec<i32> = outcome.ready.iter().map(|f| f.sequence).collect();
        assert_eq!(released, vec![1, 2]);
    }

    #[test]
    fn duplicates_discarded_but_acked() {
        let window = RxWindow::new(32);
        window.receive(frame(0));
        let duplicate = window.receive(frame(0));
        assert!(duplicate.discarded);
        assert!(duplicate.ready.is_empty());
        assert_eq!(duplicate.ack.for_sequence, 0);

        // Duplicate of a frame still buffered behind a gap.
        window.receive(frame(2));
        let buffered = window.receive(frame(2));
        assert!(buffered.discarded);
        assert_eq!(buffered.ack.for_sequence, 2);
    }

    #[test]
    fn high_water_is_monotonic() {
        let window = RxWindow::new(32);
        window.receive(frame(0));
        window.receive(frame(1));
        window.receive(frame(0));
        assert_eq!(window.high_water(), 1);
    }

    #[test]
    fn advertised_window_reflects_buffered_gap() {
        let window = RxWindow::new(4);
        assert_eq!(window.advertised_capacity(), 4);
        window.receive(frame(1));
        window.receive(frame(2));
        assert_eq!(window.advertised_capacity(), 2);
        // Filling the gap drains the buffer.
        window.receive(frame(0));
        assert_eq!(window.advertised_capacity(), 4);
    }
}
