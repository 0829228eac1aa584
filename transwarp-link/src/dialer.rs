//! Establishes outbound links: open a socket, offer a hello, await the
//! peer's hello in reply.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

use transwarp_wire::{Frame, MessageType, WireCodec, UNSEQUENCED};

use crate::config::DialerConfig;
use crate::errors::{Error, Result};
use crate::forwarder::{Forwarder, LinkEvent};
use crate::link::{DatagramSource, Link};

pub struct Dialer {
    token: String,
    config: DialerConfig,
}

impl Dialer {
    /// `token` is this router's identity, offered to peers in the hello.
    pub fn new(token: impl Into<String>, config: DialerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            token: token.into(),
            config,
        })
    }

    /// Dial `peer` and exchange hellos. The returned link is established and
    /// running; its address is the peer's token.
    pub async fn dial(
        &self,
        peer: SocketAddr,
        forwarder: Arc<dyn Forwarder>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<Link>> {
        let socket = Arc::new(UdpSocket::bind(self.config.bind_address).await?);
        let link_config = self.config.link.clone();

        let mut hello = BytesMut::new();
        WireCodec::encode_with_limit(&Frame::hello(&self.token), &mut hello, link_config.mtu)?;

        let mut buf = vec![0u8; 64 * 1024];
        for attempt in 1..=link_config.hello_attempts.max(1) {
            socket.send_to(&hello, peer).await?;
            debug!(target: "transwarp::dialer", %peer, attempt, "hello offered");

            let reply =
                tokio::time::timeout(link_config.read_timeout(), socket.recv_from(&mut buf)).await;
            let (n, from) = match reply {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            };
            if from != peer {
                debug!(target: "transwarp::dialer", %from, "reply from foreign peer dropped");
                continue;
            }
            match WireCodec::decode(&buf[..n]) {
                Ok(frame)
                    if frame.message_type == MessageType::Hello
                        && frame.sequence == UNSEQUENCED =>
                {
                    let token = frame.hello_token()?;
                    info!(target: "transwarp::dialer", %peer, token = %token, "link established");
                    return Ok(Link::spawn(
                        token,
                        socket.clone(),
                        peer,
                        DatagramSource::Socket(socket),
                        forwarder,
                        events,
                        link_config,
                    ));
                }
                Ok(frame) => {
                    debug!(
                        target: "transwarp::dialer",
                        %peer,
                        message_type = ?frame.message_type,
                        "expected hello in reply"
                    );
                }
                Err(e) => {
                    debug!(target: "transwarp::dialer", %peer, "malformed hello reply dropped: {e}")
                }
            }
        }
        Err(Error::protocol(format!("no hello reply from [{peer}]")))
    }
}
