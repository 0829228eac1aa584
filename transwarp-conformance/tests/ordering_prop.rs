//! Receive-window ordering invariants under arbitrary arrival permutations.

use proptest::prelude::*;

use transwarp_link::RxWindow;
use transwarp_wire::{Frame, MessageType};

fn frame(sequence: i32) -> Frame {
    Frame::sequenced(MessageType::Payload, sequence, vec![sequence as u8])
}

fn permutation(max: usize) -> impl Strategy<Value = Vec<i32>> {
    (1..max).prop_flat_map(|n| Just((0..n as i32).collect::<Vec<_>>()).prop_shuffle())
}

fn arrivals_with_duplicates(max: usize) -> impl Strategy<Value = (usize, Vec<i32>)> {
    (1..max).prop_flat_map(|n| {
        let base = (0..n as i32).collect::<Vec<_>>();
        let duplicates = proptest::collection::vec(0..n as i32, 0..2 * n);
        (Just(base), duplicates)
            .prop_map(|(mut arrivals, duplicates)| {
                arrivals.extend(duplicates);
                arrivals
            })
            .prop_shuffle()
            .prop_map(move |arrivals| (n, arrivals))
    })
}

proptest! {
    /// Whatever order frames 0..n arrive in, they are released upward as
    /// exactly 0..n.
    #[test]
    fn any_arrival_permutation_releases_in_order(order in permutation(48)) {
        let window = RxWindow::new(64);
        let mut released = Vec::new();
        for &sequence in &order {
            let outcome = window.receive(frame(sequence));
            prop_assert_eq!(outcome.ack.for_sequence, sequence);
            released.extend(outcome.ready.iter().map(|f| f.sequence));
        }
        let expected: Vec<i32> = (0..order.len() as i32).collect();
        prop_assert_eq!(released, expected);
        prop_assert_eq!(window.high_water(), order.len() as i32 - 1);
        prop_assert!(window.keys().is_empty());
    }

    /// Duplicates never release twice, and every receipt (duplicates
    /// included) emits exactly one ack.
    #[test]
    fn duplicate_delivery_is_idempotent((n, arrivals) in arrivals_with_duplicates(24)) {
        let window = RxWindow::new(64);
        let mut acks = 0usize;
        let mut released = Vec::new();
        for &sequence in &arrivals {
            let outcome = window.receive(frame(sequence));
            prop_assert_eq!(outcome.ack.for_sequence, sequence);
            acks += 1;
            released.extend(outcome.ready.iter().map(|f| f.sequence));
        }
        prop_assert_eq!(acks, arrivals.len());
        let expected: Vec<i32> = (0..n as i32).collect();
        prop_assert_eq!(released, expected);
    }

    /// The watermark never regresses, whatever arrives.
    #[test]
    fn high_water_is_monotonic(order in proptest::collection::vec(0i32..32, 1..64)) {
        let window = RxWindow::new(64);
        let mut last = window.high_water();
        for &sequence in &order {
            window.receive(frame(sequence));
            let now = window.high_water();
            prop_assert!(now >= last);
            last = now;
        }
    }
}
