// Callbacks a peer makes while downloading the chain

use log::info;
use tokio::sync::watch;

use crate::core::Block;
use crate::network::PeerInfo;

/// Observer of chain download progress. Implementations are called from the
/// peer's read loop while locked, so they should return quickly.
pub trait PeerEventListener: Send {
    /// A block was connected to the chain. `blocks_left` is the peer's
    /// advertised height minus ours, or -1 if the peer gave no height.
    fn on_blocks_downloaded(&mut self, _peer: &PeerInfo, _block: &Block, _blocks_left: i64) {}

    /// The peer is about to send `blocks_left` blocks
    fn on_chain_download_started(&mut self, _peer: &PeerInfo, _blocks_left: i64) {}
}

/// Logs download progress by whole percent and signals when nothing is left
#[derive(Debug)]
pub struct DownloadListener {
    original: Option<i64>,
    last_percent: i64,
    done: watch::Sender<bool>,
}

impl DownloadListener {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            original: None,
            last_percent: 0,
            done,
        }
    }

    /// Resolves to `true` once the download has caught up with the peer
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    fn finish(&mut self) {
        info!("Chain download done");
        self.done.send_replace(true);
    }
}

impl Default for DownloadListener {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerEventListener for DownloadListener {
    fn on_chain_download_started(&mut self, peer: &PeerInfo, blocks_left: i64) {
        info!("Downloading block chain of {} blocks from {}", blocks_left, peer);
        self.original = Some(blocks_left);
        if blocks_left <= 0 {
            self.finish();
        }
    }

    fn on_blocks_downloaded(&mut self, _peer: &PeerInfo, block: &Block, blocks_left: i64) {
        if blocks_left <= 0 {
            self.finish();
            return;
        }
        let Some(original) = self.original.filter(|original| *original > 0) else {
            return;
        };

        let percent = 100 - (blocks_left * 100 / original);
        if percent > self.last_percent {
            info!("Chain download {}% done, block {}", percent, block.hash());
            self.last_percent = percent;
        }
    }
}
