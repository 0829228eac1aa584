//! The link endpoint: socket ownership, handler dispatch, send/receive
//! loops, and liveness.
//!
//! Per link there are five cooperating tasks: the receive loop, the socket
//! writer draining the outbound queue, the retransmitter, the pinger, and
//! the trace consumer. All of them observe the link's shutdown token at
//! every suspension point.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use transwarp_wire::{
    Acknowledgement, Frame, MessageType, Payload, WireCodec, NO_REPLY_FOR,
};

use crate::config::LinkConfig;
use crate::errors::{Error, Result};
use crate::forwarder::{Forwarder, LinkEvent};
use crate::rx_window::{AckRequest, RxWindow};
use crate::sequence::Sequencer;
use crate::trace::{TraceRecord, TraceSink};
use crate::tx_window::TxWindow;

/// Where a link's datagrams come from: its own socket (dialed links) or a
/// per-peer queue fed by the listener's demultiplexer (accepted links).
pub(crate) enum DatagramSource {
    Socket(Arc<UdpSocket>),
    Queue(mpsc::Receiver<Vec<u8>>),
}

impl DatagramSource {
    /// One datagram, or `None` on deadline expiry / foreign traffic. A hard
    /// error means the source is gone and the link must close.
    async fn recv(
        &mut self,
        buf: &mut [u8],
        deadline: Duration,
        peer: SocketAddr,
    ) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            DatagramSource::Socket(socket) => {
                match tokio::time::timeout(deadline, socket.recv_from(buf)).await {
                    Err(_) => Ok(None),
                    Ok(Err(e)) => Err(e),
                    Ok(Ok((n, from))) => {
                        if from == peer {
                            Ok(Some(buf[..n].to_vec()))
                        } else {
                            debug!(target: "transwarp::link", %from, "datagram from foreign peer dropped");
                            Ok(None)
                        }
                    }
                }
            }
            DatagramSource::Queue(rx) => match tokio::time::timeout(deadline, rx.recv()).await {
                Err(_) => Ok(None),
                Ok(Some(datagram)) => Ok(Some(datagram)),
                Ok(None) => Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "listener demux closed",
                )),
            },
        }
    }
}

#[derive(Debug)]
struct PingState {
    last_ping_tx: Instant,
    last_ping_rx: Instant,
    last_ping_tx_sequence: i32,
    unhealthy_reported: bool,
}

/// A reliable, ordered channel to one peer router, identified by the peer's
/// token. Links are born established: the hello exchange happens in the
/// dialer/listener before construction.
pub struct Link {
    token: String,
    peer: SocketAddr,
    config: LinkConfig,
    sequencer: Sequencer,
    tx_window: Arc<TxWindow>,
    rx_window: Arc<RxWindow>,
    outbound: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    trace: TraceSink,
    forwarder: Arc<dyn Forwarder>,
    events: mpsc::Sender<LinkEvent>,
    ping: Mutex<PingState>,
    rtt_tx: watch::Sender<Option<Duration>>,
    codec_drops: AtomicU64,
}

impl Link {
    pub(crate) fn spawn(
        token: String,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        source: DatagramSource,
        forwarder: Arc<dyn Forwarder>,
        events: mpsc::Sender<LinkEvent>,
        config: LinkConfig,
    ) -> Arc<Link> {
        let shutdown = CancellationToken::new();
        let trace = if config.trace_enabled {
            TraceSink::spawn(
                &token,
                config.trace_dir.clone(),
                config.trace_queue_depth,
                shutdown.clone(),
            )
        } else {
            TraceSink::disabled()
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_depth);
        let tx_window = Arc::new(TxWindow::new(
            config.window_capacity,
            config.retransmit_delay(),
        ));
        let rx_window = Arc::new(RxWindow::new(config.window_capacity));
        let now = Instant::now();
        let (rtt_tx, _) = watch::channel(None);

        let link = Arc::new(Link {
            token,
            peer,
            config,
            sequencer: Sequencer::new(),
            tx_window: tx_window.clone(),
            rx_window,
            outbound: outbound_tx.clone(),
            shutdown: shutdown.clone(),
            trace: trace.clone(),
            forwarder,
            events,
            ping: Mutex::new(PingState {
                last_ping_tx: now,
                last_ping_rx: now,
                last_ping_tx_sequence: NO_REPLY_FOR,
                unhealthy_reported: false,
            }),
            rtt_tx,
            codec_drops: AtomicU64::new(0),
        });

        tokio::spawn(run_sender(
            socket,
            peer,
            outbound_rx,
            link.config.write_timeout(),
            shutdown.clone(),
        ));
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                tx_window
                    .run_retransmitter(outbound_tx, trace, shutdown)
                    .await
            }
        });
        tokio::spawn(run_receiver(link.clone(), source));
        tokio::spawn(run_pinger(link.clone()));

        link
    }

    /// The peer token; doubles as the link address seen by the forwarder.
    pub fn id(&self) -> &str {
        &self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Admit a payload to the tx window (blocking backpressure) and emit it.
    pub async fn send_payload(&self, payload: &Payload) -> Result<()> {
        let sequence = self.sequencer.next();
        self.send_sequenced(payload.to_frame(sequence)).await
    }

    /// Admit an acknowledgement to the tx window and emit it.
    pub async fn send_acknowledgement(&self, acknowledgement: &Acknowledgement) -> Result<()> {
        let sequence = self.sequencer.next();
        self.send_sequenced(acknowledgement.to_frame(sequence)).await
    }

    /// Signal shutdown. Every task observes the signal within its next
    /// suspension; blocked sends wake with `LinkClosed`.
    pub fn close(&self) {
        debug!(target: "transwarp::link", token = %self.token, "closing");
        self.shutdown.cancel();
        self.tx_window.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Latest measured round-trip time, updated on each matching ping echo.
    pub fn rtt(&self) -> watch::Receiver<Option<Duration>> {
        self.rtt_tx.subscribe()
    }

    /// Malformed datagrams dropped by the receive loop.
    pub fn codec_drops(&self) -> u64 {
        self.codec_drops.load(Ordering::Relaxed)
    }

    pub fn trace_overruns(&self) -> u64 {
        self.trace.overruns()
    }

    /// Admitted-but-unacknowledged frames.
    pub fn outstanding(&self) -> usize {
        self.tx_window.len()
    }

    /// Highest sequence released upward, contiguously.
    pub fn high_water(&self) -> i32 {
        self.rx_window.high_water()
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(frame.wire_len());
        WireCodec::encode_with_limit(frame, &mut buf, self.config.mtu)?;
        Ok(buf.freeze())
    }

    async fn send_sequenced(&self, frame: Frame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::LinkClosed);
        }
        let sequence = frame.sequence;
        let datagram = self.encode(&frame)?;

        match self.config.send_timeout() {
            None => self.tx_window.admit(sequence, datagram.clone()).await?,
            Some(limit) => {
                tokio::time::timeout(limit, self.tx_window.admit(sequence, datagram.clone()))
                    .await
                    .map_err(|_| Error::SendTimeout)??
            }
        }
        self.trace.emit(TraceRecord::Tx {
            sequence,
            retransmit: false,
        });
        self.trace.emit(TraceRecord::TxWindow {
            keys: self.tx_window.keys(),
            capacity: self.tx_window.available_capacity(),
        });
        self.outbound
            .send(datagram)
            .await
            .map_err(|_| Error::LinkClosed)
    }

    async fn send_ping(&self, reply_for: i32) -> Result<i32> {
        let sequence = self.sequencer.next();
        self.send_sequenced(Frame::ping(sequence, reply_for)).await?;
        Ok(sequence)
    }

    async fn send_ack(&self, ack: AckRequest) {
        let frame = Frame::ack(ack.for_sequence, ack.advertised_window);
        match self.encode(&frame) {
            Ok(datagram) => {
                self.trace.emit(TraceRecord::TxAck {
                    for_sequence: ack.for_sequence,
                });
                if self.outbound.send(datagram).await.is_err() {
                    debug!(target: "transwarp::link", token = %self.token, "outbound queue closed");
                }
            }
            Err(e) => warn!(target: "transwarp::link", token = %self.token, "ack encode failed: {e}"),
        }
    }

    async fn handle_datagram(self: &Arc<Self>, data: &[u8]) {
        let frame = match WireCodec::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.codec_drops.fetch_add(1, Ordering::Relaxed);
                debug!(target: "transwarp::link", token = %self.token, "dropping malformed datagram: {e}");
                return;
            }
        };
        match frame.message_type {
            MessageType::Ack => self.handle_ack(&frame),
            MessageType::Probe => self.handle_probe().await,
            MessageType::Hello => {
                debug!(target: "transwarp::link", token = %self.token, "duplicate hello ignored");
            }
            MessageType::Ping | MessageType::Payload | MessageType::Acknowledgement => {
                let outcome = self.rx_window.receive(frame);
                self.trace.emit(TraceRecord::Rx {
                    sequence: outcome.ack.for_sequence,
                    discard: outcome.discarded,
                });
                self.trace.emit(TraceRecord::RxWindow {
                    keys: self.rx_window.keys(),
                    high_water: self.rx_window.high_water(),
                });
                self.send_ack(outcome.ack).await;
                for frame in outcome.ready {
                    self.dispatch(frame).await;
                }
            }
        }
    }

    fn handle_ack(&self, frame: &Frame) {
        match frame.ack_fields() {
            Ok((for_sequence, advertised_window)) => {
                self.trace.emit(TraceRecord::RxAck { for_sequence });
                if self.tx_window.ack(for_sequence, advertised_window) {
                    self.trace.emit(TraceRecord::TxWindow {
                        keys: self.tx_window.keys(),
                        capacity: self.tx_window.available_capacity(),
                    });
                } else {
                    debug!(target: "transwarp::link", token = %self.token, for_sequence, "ack for absent sequence");
                }
            }
            Err(e) => {
                debug!(target: "transwarp::link", token = %self.token, "malformed ack dropped: {e}")
            }
        }
    }

    /// Unsolicited window report: where the rx side stands and how much it
    /// can take.
    async fn handle_probe(&self) {
        self.send_ack(AckRequest {
            for_sequence: self.rx_window.high_water(),
            advertised_window: self.rx_window.advertised_capacity(),
        })
        .await;
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame.message_type {
            MessageType::Ping => self.handle_ping(&frame),
            MessageType::Payload => match Payload::from_frame(&frame) {
                Ok(payload) => self.forwarder.forward_payload(&self.token, payload).await,
                Err(e) => {
                    debug!(target: "transwarp::link", token = %self.token, "malformed payload dropped: {e}")
                }
            },
            MessageType::Acknowledgement => match Acknowledgement::from_frame(&frame) {
                Ok(acknowledgement) => {
                    self.forwarder
                        .forward_acknowledgement(&self.token, acknowledgement)
                        .await
                }
                Err(e) => {
                    debug!(target: "transwarp::link", token = %self.token, "malformed acknowledgement dropped: {e}")
                }
            },
            other => {
                debug!(target: "transwarp::link", token = %self.token, ?other, "unexpected sequenced type")
            }
        }
    }

    fn handle_ping(self: &Arc<Self>, frame: &Frame) {
        match frame.ping_reply_for() {
            Ok(NO_REPLY_FOR) => {
                // Reply off the receive loop: admission may block on window
                // capacity, and the loop must keep consuming acks.
                let link = self.clone();
                let reply_for = frame.sequence;
                tokio::spawn(async move {
                    if let Err(e) = link.send_ping(reply_for).await {
                        debug!(target: "transwarp::link", token = %link.token, "ping reply failed: {e}");
                    }
                });
            }
            Ok(reply_for) => self.receive_ping_echo(reply_for),
            Err(e) => {
                debug!(target: "transwarp::link", token = %self.token, "malformed ping dropped: {e}")
            }
        }
    }

    fn receive_ping_echo(&self, reply_for: i32) {
        let mut ping = self.ping.lock().unwrap();
        if reply_for != ping.last_ping_tx_sequence {
            debug!(target: "transwarp::link", token = %self.token, reply_for, "stale ping echo");
            return;
        }
        let now = Instant::now();
        let rtt = now.duration_since(ping.last_ping_tx);
        ping.last_ping_rx = now;
        ping.unhealthy_reported = false;
        self.rtt_tx.send_replace(Some(rtt));
        debug!(target: "transwarp::link", token = %self.token, rtt_ms = rtt.as_millis() as u64, "ping echo");
    }
}

/// Sole socket writer. Write failures are logged and recovered by
/// retransmission; they never escalate.
async fn run_sender(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut outbound: mpsc::Receiver<Bytes>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            _ = shutdown.cancelled() => return,
            datagram = outbound.recv() => match datagram {
                Some(datagram) => datagram,
                None => return,
            },
        };
        match tokio::time::timeout(write_timeout, socket.send_to(&datagram, peer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(target: "transwarp::link", %peer, "socket write failed: {e}"),
            Err(_) => warn!(target: "transwarp::link", %peer, "socket write deadline expired"),
        }
    }
}

async fn run_receiver(link: Arc<Link>, mut source: DatagramSource) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let received = tokio::select! {
            _ = link.shutdown.cancelled() => return,
            received = source.recv(&mut buf, link.config.read_timeout(), link.peer) => received,
        };
        match received {
            Ok(Some(datagram)) => link.handle_datagram(&datagram).await,
            // Deadline expiry: not an error, just a shutdown observation point.
            Ok(None) => {}
            Err(e) => {
                error!(target: "transwarp::link", token = %link.token, "receive failed, closing link: {e}");
                link.close();
                return;
            }
        }
    }
}

async fn run_pinger(link: Arc<Link>) {
    let mut cycle = tokio::time::interval(link.config.ping_cycle());
    cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = link.shutdown.cancelled() => return,
            _ = cycle.tick() => {}
        }

        // Health before liveness probing: a saturated window can stall the
        // ping send, and the lapse report must not stall with it.
        let lapse = {
            let mut ping = link.ping.lock().unwrap();
            let lag = ping.last_ping_tx.duration_since(ping.last_ping_rx);
            if lag > link.config.unhealthy_after() && !ping.unhealthy_reported {
                ping.unhealthy_reported = true;
                Some(lag)
            } else {
                None
            }
        };
        if let Some(lag) = lapse {
            warn!(
                target: "transwarp::link",
                token = %link.token,
                lag_ms = lag.as_millis() as u64,
                "link unhealthy"
            );
            let _ = link.events.try_send(LinkEvent::Unhealthy {
                token: link.token.clone(),
                lag,
            });
        }

        let due = {
            let ping = link.ping.lock().unwrap();
            ping.last_ping_tx.elapsed() >= link.config.ping_interval()
        };
        if due {
            // Bounded by one cycle so a full window defers rather than
            // wedges the pinger.
            match tokio::time::timeout(link.config.ping_cycle(), link.send_ping(NO_REPLY_FOR)).await
            {
                Ok(Ok(sequence)) => {
                    let mut ping = link.ping.lock().unwrap();
                    ping.last_ping_tx = Instant::now();
                    ping.last_ping_tx_sequence = sequence;
                    debug!(target: "transwarp::link", token = %link.token, sequence, "ping request");
                }
                Ok(Err(Error::LinkClosed)) => return,
                Ok(Err(e)) => {
                    warn!(target: "transwarp::link", token = %link.token, "ping send failed: {e}")
                }
                Err(_) => {
                    debug!(target: "transwarp::link", token = %link.token, "ping deferred, window saturated")
                }
            }
        }
    }
}
