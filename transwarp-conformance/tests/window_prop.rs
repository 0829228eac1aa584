//! Transmit-window invariants: capacity bound, ack convergence, wake-up.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;

use transwarp_link::TxWindow;

fn datagram(sequence: i32) -> Bytes {
    Bytes::from(vec![sequence as u8])
}

fn permutation(max: usize) -> impl Strategy<Value = Vec<i32>> {
    (1..max).prop_flat_map(|n| Just((0..n as i32).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    /// If every ack eventually arrives, in any order, the window empties and
    /// all capacity returns.
    #[test]
    fn acks_in_any_order_empty_the_window(order in permutation(48)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let n = order.len();
            let window = TxWindow::new(n, Duration::from_secs(10));
            for sequence in 0..n as i32 {
                window.admit(sequence, datagram(sequence)).await.unwrap();
            }
            assert_eq!(window.len(), n);
            assert_eq!(window.available_capacity(), 0);
            for &sequence in &order {
                assert!(window.ack(sequence, 0));
            }
            assert!(window.is_empty());
            assert_eq!(window.available_capacity(), n);
        });
    }

    /// Repeated acks release nothing twice.
    #[test]
    fn repeated_acks_release_once(order in permutation(24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let n = order.len();
            let window = TxWindow::new(n, Duration::from_secs(10));
            for sequence in 0..n as i32 {
                window.admit(sequence, datagram(sequence)).await.unwrap();
            }
            for &sequence in &order {
                assert!(window.ack(sequence, 0));
                assert!(!window.ack(sequence, 0));
            }
            assert_eq!(window.available_capacity(), n);
        });
    }
}

/// Scenario: capacity 4, six sends with acks held. Sends five and six block
/// until two acks release capacity, then complete.
#[tokio::test]
async fn blocked_senders_wake_within_one_ack_of_capacity() {
    let window = Arc::new(TxWindow::new(4, Duration::from_secs(10)));
    for sequence in 0..4 {
        window.admit(sequence, datagram(sequence)).await.unwrap();
    }
    assert_eq!(window.len(), 4);

    let blocked: Vec<_> = (4..6)
        .map(|sequence| {
            let window = window.clone();
            tokio::spawn(async move { window.admit(sequence, datagram(sequence)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    for handle in &blocked {
        assert!(!handle.is_finished());
    }
    // The bound holds while senders wait.
    assert_eq!(window.len(), 4);

    assert!(window.ack(0, 0));
    assert!(window.ack(1, 0));
    for handle in blocked {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
    assert_eq!(window.len(), 4);
    assert_eq!(window.keys(), vec![2, 3, 4, 5]);
}
