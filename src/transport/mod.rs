pub mod connection;
pub mod pool;
pub mod sip_addr;
pub use connection::{ChannelConnection, SipConnection};
pub use pool::{TransportHandle, TransportPool};
pub use sip_addr::SipAddr;

/// A parsed inbound message together with the connection it arrived on.
///
/// Transports (external to this crate) parse the frame and hand the
/// result to `Endpoint::inject`; everything downstream keys off the
/// attached handle and source address.
pub struct IncomingMessage {
    pub message: rsip::SipMessage,
    pub connection: TransportHandle,
    pub source: SipAddr,
}

#[cfg(test)]
mod tests;
