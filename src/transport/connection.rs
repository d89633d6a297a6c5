use super::sip_addr::SipAddr;
use crate::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// Abstracts the wire for the call engine.
///
/// The concrete UDP/TCP/TLS transports live outside this crate; what
/// the engine needs from a connection is its address, its reliability
/// class (retransmission policy) and a way to push serialized
/// messages. `Channel` is the in-memory implementation used by tests
/// and embedders that drive the engine directly.
#[derive(Clone)]
pub enum SipConnection {
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Channel(conn) => conn.is_reliable(),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Channel(conn) => conn.get_addr(),
        }
    }

    pub fn remote_addr(&self) -> Option<&SipAddr> {
        match self {
            SipConnection::Channel(conn) => conn.remote_addr(),
        }
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Channel(conn) => conn.send(msg, destination).await,
        }
    }
}

impl std::fmt::Display for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipConnection::Channel(conn) => write!(f, "{}", conn),
        }
    }
}

impl std::fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}

struct ChannelInner {
    local: SipAddr,
    remote: Option<SipAddr>,
    reliable: bool,
    sink: UnboundedSender<(rsip::SipMessage, Option<SipAddr>)>,
    sent: Mutex<u64>,
}

/// In-memory connection: everything sent through it lands on the sink
/// channel, tagged with the requested destination.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub fn new(
        local: SipAddr,
        remote: Option<SipAddr>,
        reliable: bool,
        sink: UnboundedSender<(rsip::SipMessage, Option<SipAddr>)>,
    ) -> Self {
        ChannelConnection {
            inner: Arc::new(ChannelInner {
                local,
                remote,
                reliable,
                sink,
                sent: Mutex::new(0),
            }),
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.reliable
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local
    }

    pub fn remote_addr(&self) -> Option<&SipAddr> {
        self.inner.remote.as_ref()
    }

    /// Messages pushed through this connection so far.
    pub fn sent_count(&self) -> u64 {
        *self.inner.sent.lock().unwrap()
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        *self.inner.sent.lock().unwrap() += 1;
        self.inner
            .sink
            .send((msg, destination.cloned()))
            .map_err(|e| crate::Error::ChannelSendError(e.to_string()))
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.remote.as_ref() {
            Some(remote) => write!(f, "CHANNEL {} -> {}", self.inner.local, remote),
            None => write!(f, "CHANNEL {}", self.inner.local),
        }
    }
}
