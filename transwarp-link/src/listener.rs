//! Accepts inbound links: one shared socket, an accept loop that requires a
//! valid hello as the first datagram from an unknown peer, and a per-peer
//! demultiplexer feeding each established link's receive loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use transwarp_wire::{Frame, MessageType, WireCodec, UNSEQUENCED};

use crate::config::ListenerConfig;
use crate::errors::Result;
use crate::forwarder::{Forwarder, LinkEvent};
use crate::link::{DatagramSource, Link};

struct PeerEntry {
    inbound: mpsc::Sender<Vec<u8>>,
    link: Arc<Link>,
}

pub struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    peers: Arc<Mutex<HashMap<SocketAddr, PeerEntry>>>,
}

impl Listener {
    /// Bind and start accepting. Accepted links are handed to the caller via
    /// `LinkEvent::Accepted` on `events`.
    pub async fn bind(
        token: impl Into<String>,
        config: ListenerConfig,
        forwarder: Arc<dyn Forwarder>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Listener> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(config.bind_address).await?);
        let local_addr = socket.local_addr()?;
        let shutdown = CancellationToken::new();
        let peers = Arc::new(Mutex::new(HashMap::new()));

        info!(target: "transwarp::listener", %local_addr, "listening");
        tokio::spawn(run_accept(
            token.into(),
            socket,
            config,
            forwarder,
            events,
            shutdown.clone(),
            peers.clone(),
        ));

        Ok(Listener {
            local_addr,
            shutdown,
            peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every accepted link.
    pub fn close(&self) {
        self.shutdown.cancel();
        let peers = self.peers.lock().unwrap();
        for entry in peers.values() {
            entry.link.close();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_accept(
    token: String,
    socket: Arc<UdpSocket>,
    config: ListenerConfig,
    forwarder: Arc<dyn Forwarder>,
    events: mpsc::Sender<LinkEvent>,
    shutdown: CancellationToken,
    peers: Arc<Mutex<HashMap<SocketAddr, PeerEntry>>>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = tokio::time::timeout(
                config.link.read_timeout(),
                socket.recv_from(&mut buf),
            ) => received,
        };
        let (n, from) = match received {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!(target: "transwarp::listener", "socket read failed, stopping accept: {e}");
                shutdown.cancel();
                return;
            }
        };
        let datagram = buf[..n].to_vec();

        // Known peer: route into its link. A closed inbound queue means the
        // link went away; forget it and treat the datagram as first contact.
        let routed = {
            let mut map = peers.lock().unwrap();
            match map.get(&from) {
                Some(entry) => match entry.inbound.try_send(datagram.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(target: "transwarp::listener", %from, "inbound queue full, datagram dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        map.remove(&from);
                        false
                    }
                },
                None => false,
            }
        };
        if routed {
            continue;
        }

        // Unknown peer: the first datagram must be a valid hello.
        let frame = match WireCodec::decode(&datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: "transwarp::listener", %from, "malformed first datagram dropped: {e}");
                continue;
            }
        };
        if frame.message_type != MessageType::Hello || frame.sequence != UNSEQUENCED {
            debug!(
                target: "transwarp::listener",
                %from,
                message_type = ?frame.message_type,
                "expected hello from unknown peer"
            );
            continue;
        }
        let peer_token = match frame.hello_token() {
            Ok(peer_token) => peer_token,
            Err(e) => {
                debug!(target: "transwarp::listener", %from, "hello with invalid token dropped: {e}");
                continue;
            }
        };

        // Identify ourselves; the dialer blocks on this reply.
        let mut reply = BytesMut::new();
        match WireCodec::encode_with_limit(&Frame::hello(&token), &mut reply, config.link.mtu) {
            Ok(()) => {
                if let Err(e) = socket.send_to(&reply, from).await {
                    warn!(target: "transwarp::listener", %from, "hello reply failed: {e}");
                    continue;
                }
            }
            Err(e) => {
                warn!(target: "transwarp::listener", "hello encode failed: {e}");
                continue;
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(config.link.outbound_queue_depth);
        let link = Link::spawn(
            peer_token.clone(),
            socket.clone(),
            from,
            DatagramSource::Queue(inbound_rx),
            forwarder.clone(),
            events.clone(),
            config.link.clone(),
        );
        info!(target: "transwarp::listener", %from, token = %peer_token, "link accepted");
        peers.lock().unwrap().insert(
            from,
            PeerEntry {
                inbound: inbound_tx,
                link: link.clone(),
            },
        );
        if events.send(LinkEvent::Accepted(link)).await.is_err() {
            debug!(target: "transwarp::listener", "event channel closed");
        }
    }
}
