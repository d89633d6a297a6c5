//! Sharded map of (service, Call-ID) to live call actors.

use crate::call::{Call, WorkItem};
use crate::endpoint::EndpointInnerRef;
use crate::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::debug;

pub type CallMailbox = UnboundedSender<WorkItem>;

/// Routes work items to call actors, spawning one on first
/// reference. Shard count comes from `msg_routers`; the actor count
/// is capped by `max_calls`.
pub struct Router {
    shards: Vec<Mutex<HashMap<String, CallMailbox>>>,
    active: AtomicUsize,
}

impl Router {
    pub fn new(shards: usize) -> Self {
        let shards = shards.clamp(1, 127);
        Router {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            active: AtomicUsize::new(0),
        }
    }

    fn shard(&self, call_id: &str) -> &Mutex<HashMap<String, CallMailbox>> {
        let mut hasher = DefaultHasher::new();
        call_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn len(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver without spawning; timer events for dead calls vanish
    /// here.
    pub fn deliver(&self, call_id: &str, item: WorkItem) -> bool {
        let shard = self.shard(call_id).lock().unwrap();
        match shard.get(call_id) {
            Some(mailbox) => mailbox.send(item).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, call_id: &str) {
        let mut shard = self.shard(call_id).lock().unwrap();
        if shard.remove(call_id).is_some() {
            self.active.fetch_sub(1, Ordering::Relaxed);
            debug!(call_id, "call unregistered");
        }
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock().unwrap();
            self.active.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }
}

/// Look up or spawn the actor for `call_id` and hand it `item`.
/// Overflowing `max_calls` fails without enqueueing anything.
pub fn send_work(endpoint: &EndpointInnerRef, call_id: &str, item: WorkItem) -> Result<()> {
    let router = &endpoint.router;
    let mut shard = router.shard(call_id).lock().unwrap();
    if let Some(mailbox) = shard.get(call_id) {
        if mailbox.send(item).is_ok() {
            return Ok(());
        }
        // the actor is gone but not yet unregistered; respawn below
        shard.remove(call_id);
        router.active.fetch_sub(1, Ordering::Relaxed);
    }

    if router.active.load(Ordering::Relaxed) >= endpoint.config.max_calls {
        return Err(Error::TooManyCalls);
    }

    let (mailbox, receiver) = unbounded_channel();
    mailbox
        .send(item)
        .map_err(|e| Error::ChannelSendError(e.to_string()))?;
    shard.insert(call_id.to_string(), mailbox);
    router.active.fetch_add(1, Ordering::Relaxed);
    debug!(call_id, "call spawned");
    tokio::spawn(Call::run(
        endpoint.clone(),
        call_id.to_string(),
        receiver,
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_clamped() {
        assert_eq!(Router::new(0).shards.len(), 1);
        assert_eq!(Router::new(64).shards.len(), 64);
        assert_eq!(Router::new(1000).shards.len(), 127);
    }

    #[test]
    fn test_deliver_to_missing_call() {
        let router = Router::new(4);
        assert!(!router.deliver("nobody@example.com", WorkItem::Crash));
        assert!(router.is_empty());
    }
}
