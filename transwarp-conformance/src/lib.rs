#![forbid(unsafe_code)]

//! TRANSWARP conformance helpers.
//!
//! Small, self-contained utilities shared by the conformance tests: a
//! datagram relay that can drop or mangle selected frames between two real
//! sockets, and a forwarder that records upward deliveries on channels.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use transwarp_link::Forwarder;
use transwarp_wire::{Acknowledgement, Frame, Payload, WireCodec};

/// Which way a datagram is travelling through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    /// From the dialing side toward the relayed target.
    ToTarget,
    /// From the target back toward the dialing side.
    ToCaller,
}

/// What the relay should do with one datagram.
pub enum RelayAction {
    Forward,
    Drop,
    Replace(Vec<u8>),
    /// Buffer this datagram and emit it right after the next datagram
    /// forwarded in the same direction, swapping their wire order.
    HoldUntilNext,
}

pub type RelayPolicy = Box<dyn FnMut(RelayDirection, &[u8]) -> RelayAction + Send>;

/// A UDP man-in-the-middle for loss and corruption scenarios. The first
/// socket to send through the front becomes the caller; everything else is
/// forwarded between caller and target subject to the policy.
pub struct Relay {
    front_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Relay {
    pub async fn spawn(target: SocketAddr, policy: RelayPolicy) -> std::io::Result<Relay> {
        let front = UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
        let back = UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
        let front_addr = front.local_addr()?;
        let shutdown = CancellationToken::new();
        tokio::spawn(run_relay(front, back, target, policy, shutdown.clone()));
        Ok(Relay {
            front_addr,
            shutdown,
        })
    }

    /// Address the caller should dial instead of the target.
    pub fn addr(&self) -> SocketAddr {
        self.front_addr
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_relay(
    front: UdpSocket,
    back: UdpSocket,
    target: SocketAddr,
    mut policy: RelayPolicy,
    shutdown: CancellationToken,
) {
    let mut caller: Option<SocketAddr> = None;
    let mut front_buf = vec![0u8; 64 * 1024];
    let mut back_buf = vec![0u8; 64 * 1024];
    // Datagrams parked by `HoldUntilNext`, flushed after the next forward in
    // the same direction.
    let mut held_to_target: Vec<Vec<u8>> = Vec::new();
    let mut held_to_caller: Vec<Vec<u8>> = Vec::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = front.recv_from(&mut front_buf) => {
                let Ok((n, from)) = received else { return };
                if caller.is_none() {
                    caller = Some(from);
                }
                if caller != Some(from) {
                    continue;
                }
                match policy(RelayDirection::ToTarget, &front_buf[..n]) {
                    RelayAction::Forward => {
                        let _ = back.send_to(&front_buf[..n], target).await;
                        for held in held_to_target.drain(..) {
                            let _ = back.send_to(&held, target).await;
                        }
                    }
                    RelayAction::Drop => debug!(target: "transwarp::relay", "dropped toward target"),
                    RelayAction::Replace(data) => {
                        let _ = back.send_to(&data, target).await;
                        for held in held_to_target.drain(..) {
                            let _ = back.send_to(&held, target).await;
                        }
                    }
                    RelayAction::HoldUntilNext => held_to_target.push(front_buf[..n].to_vec()),
                }
            }
            received = back.recv_from(&mut back_buf) => {
                let Ok((n, from)) = received else { return };
                if from != target {
                    continue;
                }
                let Some(caller) = caller else { continue };
                match policy(RelayDirection::ToCaller, &back_buf[..n]) {
                    RelayAction::Forward => {
                        let _ = front.send_to(&back_buf[..n], caller).await;
                        for held in held_to_caller.drain(..) {
                            let _ = front.send_to(&held, caller).await;
                        }
                    }
                    RelayAction::Drop => debug!(target: "transwarp::relay", "dropped toward caller"),
                    RelayAction::Replace(data) => {
                        let _ = front.send_to(&data, caller).await;
                        for held in held_to_caller.drain(..) {
                            let _ = front.send_to(&held, caller).await;
                        }
                    }
                    RelayAction::HoldUntilNext => held_to_caller.push(back_buf[..n].to_vec()),
                }
            }
        }
    }
}

/// Decode a relayed datagram, if it parses as a frame. Policies use this to
/// pick their victims.
pub fn peek_frame(data: &[u8]) -> Option<Frame> {
    WireCodec::decode(data).ok()
}

/// A forwarder that records every upward delivery on unbounded channels.
pub struct RecordingForwarder {
    payloads: mpsc::UnboundedSender<(String, Payload)>,
    acknowledgements: mpsc::UnboundedSender<(String, Acknowledgement)>,
}

impl RecordingForwarder {
    #[allow(clippy::type_complexity)]
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(String, Payload)>,
        mpsc::UnboundedReceiver<(String, Acknowledgement)>,
    ) {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                payloads: payload_tx,
                acknowledgements: ack_tx,
            }),
            payload_rx,
            ack_rx,
        )
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward_payload(&self, link_address: &str, payload: Payload) {
        let _ = self.payloads.send((link_address.to_string(), payload));
    }

    async fn forward_acknowledgement(&self, link_address: &str, acknowledgement: Acknowledgement) {
        let _ = self
            .acknowledgements
            .send((link_address.to_string(), acknowledgement));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_forwards_both_directions() {
        let echo = UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let relay = Relay::spawn(echo_addr, Box::new(|_, _| RelayAction::Forward))
            .await
            .unwrap();
        let client = UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        client.send_to(b"ping-me", relay.addr()).await.unwrap();
        let mut buf = vec![0u8; 64];
        let (n, from) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(from, relay.addr());
        assert_eq!(&buf[..n], b"ping-me");
    }

    #[tokio::test]
    async fn recording_forwarder_captures_deliveries() {
        let (forwarder, mut payloads, _acks) = RecordingForwarder::new();
        forwarder
            .forward_payload(
                "router-x",
                Payload {
                    session_id: "s".into(),
                    flags: 0,
                    sequence: 1,
                    headers: Default::default(),
                    data: vec![1],
                },
            )
            .await;
        let (address, payload) = payloads.recv().await.unwrap();
        assert_eq!(address, "router-x");
        assert_eq!(payload.sequence, 1);
    }
}
