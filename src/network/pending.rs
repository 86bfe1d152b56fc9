// One-shot handles for blocks requested with get_block

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::{Block, Hash256};
use crate::error::{Error, Result};
use crate::network::InventoryItem;

/// Shared between the caller's handle and the peer's request table
#[derive(Debug, Default)]
struct Slot {
    block: Mutex<Option<Block>>,
    ready: Notify,
    cancelled: AtomicBool,
}

impl Slot {
    fn get(&self) -> Option<Block> {
        self.block.lock().ok().and_then(|block| block.clone())
    }
}

/// A block that will arrive at some point.
///
/// The slot is filled at most once, by the peer's read loop. If the peer
/// disconnects first it is never filled and [`PendingBlock::wait`] does not
/// return; use [`PendingBlock::wait_timeout`] to bound the wait.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    hash: Hash256,
    slot: Arc<Slot>,
}

impl PendingBlock {
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub async fn wait(&self) -> Block {
        loop {
            let notified = self.slot.ready.notified();
            tokio::pin!(notified);
            // register before checking so a fill between the check and the await is not missed
            notified.as_mut().enable();

            if let Some(block) = self.slot.get() {
                return block;
            }
            notified.await;
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Block> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Timeout(format!("block {} after {:?}", self.hash, timeout)))
    }

    pub fn try_get(&self) -> Option<Block> {
        self.slot.get()
    }

    /// The block arrived or the caller cancelled
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.slot.block.lock().map(|block| block.is_some()).unwrap_or(false)
    }

    /// Record that the caller lost interest. The request stays registered
    /// and the block is still delivered, so this always returns `false`.
    pub fn cancel(&self) -> bool {
        self.slot.cancelled.store(true, Ordering::SeqCst);
        false
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.cancelled.load(Ordering::SeqCst)
    }
}

/// Entry in a peer's table of outstanding `getdata` requests
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) item: InventoryItem,
    slot: Arc<Slot>,
}

impl PendingRequest {
    /// A request for `hash` and the handle that observes it
    pub(crate) fn block(hash: Hash256) -> (Self, PendingBlock) {
        let slot = Arc::new(Slot::default());
        let request = Self {
            item: InventoryItem::block(hash),
            slot: Arc::clone(&slot),
        };
        (request, PendingBlock { hash, slot })
    }

    pub(crate) fn matches(&self, hash: &Hash256) -> bool {
        self.item.hash == *hash
    }

    /// Fill the slot unless something already did, then wake every waiter
    pub(crate) fn fulfil(self, block: Block) {
        if let Ok(mut slot) = self.slot.block.lock() {
            if slot.is_none() {
                *slot = Some(block);
            }
        }
        self.slot.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NetworkParams;

    #[tokio::test]
    async fn test_fulfilled_handle_returns_block() {
        let genesis = NetworkParams::unit_test().genesis_block();
        let (request, handle) = PendingRequest::block(genesis.hash());
        assert!(!handle.is_done());
        assert!(handle.try_get().is_none());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tokio::task::yield_now().await;

        request.fulfil(genesis.clone());
        assert_eq!(waiter.await.unwrap(), genesis);
        assert!(handle.is_done());
        assert_eq!(handle.try_get(), Some(genesis));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let (_request, handle) = PendingRequest::block(Hash256::new([9; 32]));
        let result = handle.wait_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_does_not_stop_delivery() {
        let genesis = NetworkParams::unit_test().genesis_block();
        let (request, handle) = PendingRequest::block(genesis.hash());

        assert!(!handle.is_done());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(handle.is_done());
        assert!(handle.try_get().is_none());

        request.fulfil(genesis.clone());
        assert_eq!(handle.wait().await, genesis);
    }
}
