use super::{connection::SipConnection, sip_addr::SipAddr};
use std::{
    fmt,
    sync::{Arc, RwLock},
};
use tracing::debug;

/// Opaque, copyable reference to a pooled connection.
///
/// The epoch guards against slot reuse: a handle minted for a closed
/// connection never validates against a newer occupant of the same
/// slot, which is what makes encoded flow tokens safe to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle {
    pub index: u32,
    pub epoch: u32,
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.epoch)
    }
}

struct Slot {
    epoch: u32,
    conn: Option<SipConnection>,
}

struct PoolInner {
    slots: RwLock<Vec<Slot>>,
}

/// Registry of live connections shared by every call actor.
///
/// The pool is the only cross-call view of the transport layer: flow
/// tokens pin connections by (index, epoch) identity, and closing a
/// connection invalidates every token that references it.
#[derive(Clone)]
pub struct TransportPool {
    inner: Arc<PoolInner>,
}

impl Default for TransportPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportPool {
    pub fn new() -> Self {
        TransportPool {
            inner: Arc::new(PoolInner {
                slots: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn add(&self, conn: SipConnection) -> TransportHandle {
        let mut slots = self.inner.slots.write().unwrap();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.conn.is_none() {
                slot.epoch += 1;
                slot.conn = Some(conn);
                return TransportHandle {
                    index: index as u32,
                    epoch: slot.epoch,
                };
            }
        }
        slots.push(Slot {
            epoch: 1,
            conn: Some(conn),
        });
        TransportHandle {
            index: (slots.len() - 1) as u32,
            epoch: 1,
        }
    }

    pub fn get(&self, handle: TransportHandle) -> Option<SipConnection> {
        let slots = self.inner.slots.read().unwrap();
        let slot = slots.get(handle.index as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.conn.clone()
    }

    pub fn is_alive(&self, handle: TransportHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn close(&self, handle: TransportHandle) {
        let mut slots = self.inner.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(handle.index as usize) {
            if slot.epoch == handle.epoch && slot.conn.take().is_some() {
                debug!(%handle, "connection closed");
            }
        }
    }

    /// First live connection whose local address matches.
    pub fn lookup(&self, addr: &SipAddr) -> Option<TransportHandle> {
        let slots = self.inner.slots.read().unwrap();
        for (index, slot) in slots.iter().enumerate() {
            if let Some(conn) = slot.conn.as_ref() {
                let local = conn.get_addr();
                let transport_match = match (addr.r#type, local.r#type) {
                    (Some(want), Some(have)) => want == have,
                    _ => true,
                };
                if transport_match && local.addr == addr.addr {
                    return Some(TransportHandle {
                        index: index as u32,
                        epoch: slot.epoch,
                    });
                }
            }
        }
        None
    }

    /// Live connection already pointing at `remote`, if any. Used to
    /// reuse registrar flows instead of opening a second connection.
    pub fn lookup_remote(&self, remote: &SipAddr) -> Option<TransportHandle> {
        let slots = self.inner.slots.read().unwrap();
        for (index, slot) in slots.iter().enumerate() {
            if let Some(conn) = slot.conn.as_ref() {
                let transport_match = match (remote.r#type, conn.get_addr().r#type) {
                    (Some(want), Some(have)) => want == have,
                    _ => true,
                };
                if transport_match && conn.remote_addr().map(|r| &r.addr) == Some(&remote.addr) {
                    return Some(TransportHandle {
                        index: index as u32,
                        epoch: slot.epoch,
                    });
                }
            }
        }
        None
    }

    /// Whether `addr` names one of our own listening addresses.
    pub fn is_local(&self, addr: &rsip::HostWithPort) -> bool {
        let slots = self.inner.slots.read().unwrap();
        slots.iter().any(|slot| {
            slot.conn
                .as_ref()
                .map(|conn| &conn.get_addr().addr == addr)
                .unwrap_or(false)
        })
    }

    /// Any live connection; the fallback when no better match exists.
    pub fn any(&self) -> Option<TransportHandle> {
        let slots = self.inner.slots.read().unwrap();
        for (index, slot) in slots.iter().enumerate() {
            if slot.conn.is_some() {
                return Some(TransportHandle {
                    index: index as u32,
                    epoch: slot.epoch,
                });
            }
        }
        None
    }
}
