// Peer session: one connection, its read loop and the chain download

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Notify;

use crate::consensus::TransactionValidator;
use crate::core::{Block, Hash256, NetworkParams, Transaction};
use crate::error::{Error, Result};
use crate::network::{
    GetBlocksMessage, InventoryItem, InventoryKind, InventoryMessage, Message, PeerEventListener, PendingBlock,
    PendingRequest, TcpTransport, Transport, VersionMessage,
};
use crate::storage::BlockChain;

/// Settings for one peer connection
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub params: NetworkParams,
    /// Height we advertise in our version message
    pub best_height: u32,
    /// Bound on TCP connect plus handshake
    pub connect_timeout: Duration,
    /// Ask the remote side not to relay transactions to us
    pub mobile_optimized: bool,
    /// Keep block and transaction bodies unparsed until first accessed
    pub parse_lazy: bool,
    pub user_agent: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            params: NetworkParams::default(),
            best_height: 0,
            connect_timeout: Duration::from_secs(60),
            mobile_optimized: false,
            parse_lazy: true,
            user_agent: concat!("/btc-peer:", env!("CARGO_PKG_VERSION"), "/").to_string(),
        }
    }
}

/// What we know about the remote side, handed to listeners
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub addr: Option<SocketAddr>,
    pub version: u32,
    pub services: u64,
    pub start_height: i32,
    pub user_agent: String,
}

impl PeerInfo {
    fn from_version(addr: Option<SocketAddr>, version: &VersionMessage) -> Self {
        Self {
            addr,
            version: version.version,
            services: version.services,
            start_height: version.start_height,
            user_agent: version.user_agent.clone(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{} ({})", addr, self.user_agent),
            None => write!(f, "peer ({})", self.user_agent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connected,
    Running,
    Disconnecting,
}

pub type SharedListener = Arc<Mutex<dyn PeerEventListener>>;

/// A connection to one remote node.
///
/// One task drives [`Peer::run`]; other tasks share the peer through an
/// `Arc` to request blocks, start the chain download or broadcast.
pub struct Peer<T: Transport> {
    config: PeerConfig,
    address: Option<SocketAddr>,
    chain: Arc<BlockChain>,
    transport: OnceLock<T>,
    state: Mutex<PeerState>,
    running: AtomicBool,
    download_data: AtomicBool,
    pending: Mutex<Vec<PendingRequest>>,
    listeners: Mutex<Vec<SharedListener>>,
    shutdown: Notify,
}

impl Peer<TcpTransport> {
    /// A peer for `address`, not yet connected
    pub fn new(config: PeerConfig, address: SocketAddr, chain: Arc<BlockChain>) -> Self {
        Self::build(config, Some(address), chain, OnceLock::new(), PeerState::Disconnected)
    }

    /// Open the TCP connection and handshake. A peer connects only once.
    pub async fn connect(&self) -> Result<()> {
        if self.state() != PeerState::Disconnected || self.transport.get().is_some() {
            return Err(Error::PreconditionViolation(format!(
                "peer is {:?}; connections are not reused",
                self.state()
            )));
        }
        let address = self
            .address
            .ok_or_else(|| Error::PreconditionViolation("peer has no address".to_string()))?;

        let mut config = self.config.clone();
        config.best_height = config.best_height.max(self.chain.best_height()?);

        let transport = TcpTransport::connect(address, &config).await?;
        if self.transport.set(transport).is_err() {
            return Err(Error::PreconditionViolation("peer connected twice".to_string()));
        }
        *self.lock_state() = PeerState::Connected;
        Ok(())
    }
}

impl<T: Transport> Peer<T> {
    /// A peer over an already handshaken transport, starting `Connected`
    pub fn with_transport(config: PeerConfig, chain: Arc<BlockChain>, transport: T) -> Self {
        Self::build(config, None, chain, OnceLock::from(transport), PeerState::Connected)
    }

    fn build(
        config: PeerConfig,
        address: Option<SocketAddr>,
        chain: Arc<BlockChain>,
        transport: OnceLock<T>,
        state: PeerState,
    ) -> Self {
        Self {
            config,
            address,
            chain,
            transport,
            state: Mutex::new(state),
            running: AtomicBool::new(false),
            download_data: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn state(&self) -> PeerState {
        *self.lock_state()
    }

    /// The remote side as seen at handshake, if connected
    pub fn info(&self) -> Option<PeerInfo> {
        self.transport
            .get()
            .map(|transport| PeerInfo::from_version(self.address, transport.peer_version()))
    }

    fn lock_state(&self) -> MutexGuard<'_, PeerState> {
        // PeerState is Copy and always valid, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transport(&self) -> Result<&T> {
        self.transport
            .get()
            .ok_or_else(|| Error::PreconditionViolation("peer is not connected".to_string()))
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.transport()?.write_message(&message).await
    }

    /// Read and dispatch messages until the connection fails or
    /// [`Peer::disconnect`] is called. Messages that fail to decode or
    /// validate are logged and skipped.
    pub async fn run(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state != PeerState::Connected {
                return Err(Error::PreconditionViolation(format!("cannot run a peer that is {:?}", *state)));
            }
            *state = PeerState::Running;
        }
        self.running.store(true, Ordering::SeqCst);
        let transport = self.transport()?;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let result = tokio::select! {
                _ = self.shutdown.notified() => break,
                message = transport.read_message() => match message {
                    Ok(message) => self.process_message(message).await,
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_message_local() => warn!("Dropping message from {}: {}", self.describe(), e),
                Err(_) if !self.running.load(Ordering::SeqCst) => break,
                Err(e) => {
                    error!("Connection to {} failed: {}", self.describe(), e);
                    self.disconnect().await;
                    return Err(match e {
                        Error::PeerDisconnected(reason) => Error::PeerDisconnected(reason),
                        other => Error::PeerDisconnected(other.to_string()),
                    });
                }
            }
        }

        debug!("Read loop for {} stopped", self.describe());
        Ok(())
    }

    /// Stop the read loop and close the connection. Outstanding
    /// [`PendingBlock`]s are left unresolved.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        {
            let mut state = self.lock_state();
            if *state == PeerState::Disconnected {
                return;
            }
            *state = PeerState::Disconnecting;
        }

        self.shutdown.notify_one();
        if let Some(transport) = self.transport.get() {
            transport.shutdown().await;
        }

        *self.lock_state() = PeerState::Disconnected;
        info!("Disconnected from {}", self.describe());
    }

    fn describe(&self) -> String {
        match self.address {
            Some(addr) => addr.to_string(),
            None => "peer".to_string(),
        }
    }

    async fn process_message(&self, message: Message) -> Result<()> {
        match message {
            Message::Inventory(inv) => self.process_inventory(inv).await,
            Message::Block(block) => self.process_block(block).await,
            Message::Ping(Some(nonce)) => self.send(Message::Pong(nonce)).await,
            Message::Ping(None) => Ok(()),
            Message::Address(addr) => {
                debug!("{} sent {} addresses", self.describe(), addr.addresses.len());
                Ok(())
            }
            other => {
                debug!("{} sent {}, ignoring", self.describe(), other);
                Ok(())
            }
        }
    }

    async fn process_inventory(&self, inv: InventoryMessage) -> Result<()> {
        if !self.download_data() {
            debug!("Ignoring inv with {} items, not downloading", inv.items.len());
            return Ok(());
        }

        // A lone block we are missing the parent of: the remote node is
        // telling us to ask for more of the chain leading to it.
        if let [item] = inv.items.as_slice() {
            if item.kind == InventoryKind::Block && self.chain.unconnected_block() == Some(item.hash) {
                return self.block_chain_download(item.hash).await;
            }
        }

        let wanted: Vec<InventoryItem> = inv.block_hashes().map(InventoryItem::block).collect();
        if wanted.is_empty() {
            return Ok(());
        }
        debug!("Requesting {} blocks", wanted.len());
        self.send(Message::GetData(InventoryMessage::new(wanted))).await
    }

    async fn process_block(&self, block: Block) -> Result<()> {
        let hash = block.hash();

        let request = {
            let mut pending = self.lock_pending();
            pending
                .iter()
                .position(|request| request.matches(&hash))
                .map(|index| pending.remove(index))
        };
        if let Some(request) = request {
            debug!("Block {} answers a get_block request", hash);
            request.fulfil(block);
            return Ok(());
        }

        match self.chain.add(block.clone()) {
            Ok(true) => {
                self.notify_blocks_downloaded(&block);
                Ok(())
            }
            Ok(false) => self.block_chain_download(hash).await,
            Err(Error::BlockValidationFailure(e)) => {
                warn!("Block {} from {} failed validation: {}", hash, self.describe(), e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_download_data(&self, download_data: bool) {
        self.download_data.store(download_data, Ordering::SeqCst);
    }

    pub fn download_data(&self) -> bool {
        self.download_data.load(Ordering::SeqCst)
    }

    pub fn add_event_listener(&self, listener: SharedListener) {
        self.lock_listeners().push(listener);
    }

    /// Returns whether the listener was registered
    pub fn remove_event_listener(&self, listener: &SharedListener) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() != before
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<SharedListener>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn for_each_listener(&self, mut f: impl FnMut(&mut dyn PeerEventListener, &PeerInfo)) {
        let listeners = self.lock_listeners().clone();
        let info = self.info().unwrap_or_default();
        for listener in listeners {
            match listener.lock() {
                Ok(mut listener) => f(&mut *listener, &info),
                Err(_) => warn!("Skipping a listener that panicked earlier"),
            }
        }
    }

    fn notify_blocks_downloaded(&self, block: &Block) {
        let blocks_left = self.blocks_to_get().unwrap_or(-1);
        self.for_each_listener(|listener, info| listener.on_blocks_downloaded(info, block, blocks_left));
    }

    /// Blocks the remote side has beyond our head, or -1 if it advertised no height
    pub fn blocks_to_get(&self) -> Result<i64> {
        let start_height = self.transport()?.peer_version().start_height;
        if start_height <= 0 {
            return Ok(-1);
        }
        Ok(i64::from(start_height) - i64::from(self.chain.best_height()?))
    }

    /// Relay one of our own transactions
    pub async fn broadcast_transaction(&self, tx: &Transaction) -> Result<()> {
        TransactionValidator::validate_for_broadcast(tx)?;
        info!("Broadcasting transaction {}", tx.hash());
        self.send(Message::Transaction(tx.clone())).await
    }

    /// Ask for the blocks after our chain head, up to `target` (zero for as
    /// many as the remote side will send).
    pub async fn block_chain_download(&self, target: Hash256) -> Result<()> {
        let head = self.chain.chain_head()?;
        let genesis = self.chain.genesis_hash();

        let mut locator = Vec::with_capacity(3);
        let head_hash = head.hash();
        if head_hash != genesis {
            locator.push(head_hash);
            if head.header.prev_block_hash != genesis {
                locator.push(head.header.prev_block_hash);
            }
        }
        locator.push(genesis);

        info!("block_chain_download({}) current head = {}", target, head_hash);
        self.send(Message::GetBlocks(GetBlocksMessage::new(locator, target))).await
    }

    /// Turn on block downloading and, if the remote side is ahead of us,
    /// ask it for the rest of the chain.
    pub async fn start_block_chain_download(&self) -> Result<()> {
        self.set_download_data(true);

        let blocks_left = self.blocks_to_get()?;
        if blocks_left <= 0 {
            info!("Chain is up to date with {} ({} blocks to get)", self.describe(), blocks_left);
            return Ok(());
        }

        self.for_each_listener(|listener, info| listener.on_chain_download_started(info, blocks_left));
        self.block_chain_download(Hash256::zero()).await
    }

    /// Request one block by hash. The returned handle resolves when the
    /// block arrives on this connection.
    pub async fn get_block(&self, hash: Hash256) -> Result<PendingBlock> {
        let (request, handle) = PendingRequest::block(hash);
        let item = request.item;
        self.lock_pending().push(request);

        let result = self
            .send(Message::GetData(InventoryMessage::new(vec![item])))
            .await;
        if let Err(e) = result {
            // a failed request must not swallow a later unsolicited copy
            let mut pending = self.lock_pending();
            if let Some(index) = pending.iter().rposition(|request| request.matches(&hash)) {
                pending.remove(index);
            }
            return Err(e);
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PROTOCOL_VERSION;
    use crate::network::DownloadListener;
    use crate::test_util::{mine_block, unit_test_chain, MockTransport};

    fn peer_with_height(start_height: i32) -> (Arc<Peer<MockTransport>>, crate::test_util::MockRemote, Arc<BlockChain>) {
        let (chain, params) = unit_test_chain();
        let chain = Arc::new(chain);
        let (transport, remote) = MockTransport::new(start_height);
        let config = PeerConfig {
            params,
            ..PeerConfig::default()
        };
        let peer = Arc::new(Peer::with_transport(config, Arc::clone(&chain), transport));
        (peer, remote, chain)
    }

    fn spawn_run(peer: &Arc<Peer<MockTransport>>) -> tokio::task::JoinHandle<Result<()>> {
        let peer = Arc::clone(peer);
        tokio::spawn(async move { peer.run().await })
    }

    #[tokio::test]
    async fn test_run_requires_connected() {
        let (peer, _remote, _) = peer_with_height(0);
        peer.disconnect().await;
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(matches!(peer.run().await, Err(Error::PreconditionViolation(_))));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (peer, mut remote, _) = peer_with_height(0);
        let handle = spawn_run(&peer);

        remote.send(Message::Ping(Some(99)));
        assert!(matches!(remote.next_written().await, Message::Pong(99)));

        peer.disconnect().await;
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_failure_disconnects() {
        let (peer, remote, _) = peer_with_height(0);
        let handle = spawn_run(&peer);

        remote.fail("reset by peer");
        assert!(matches!(handle.await.unwrap(), Err(Error::PeerDisconnected(_))));
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_stop_loop() {
        let (peer, mut remote, _) = peer_with_height(0);
        let handle = spawn_run(&peer);

        remote.send_error(Error::ProtocolViolation("1025 addresses".to_string()));
        remote.send(Message::Ping(Some(1)));
        assert!(matches!(remote.next_written().await, Message::Pong(1)));

        peer.disconnect().await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_block_with_overflowing_outputs_is_dropped() {
        use crate::core::{OutPoint, TxInput};

        let (peer, mut remote, chain) = peer_with_height(1);
        peer.set_download_data(true);
        let handle = spawn_run(&peer);

        let mut tx = Transaction::new();
        tx.add_input(TxInput::new(OutPoint::new(Hash256::new([9; 32]), 0), vec![0x51]))
            .unwrap();
        tx.add_output(u64::MAX, vec![0x51]).unwrap();
        tx.add_output(2, vec![0x51]).unwrap();
        let block = mine_block(&chain.params().genesis_block(), vec![tx]);

        remote.send(Message::Block(block));
        remote.send(Message::Ping(Some(7)));
        assert!(matches!(remote.next_written().await, Message::Pong(7)));
        assert_eq!(peer.state(), PeerState::Running);
        assert_eq!(chain.best_height().unwrap(), 0);

        peer.disconnect().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_download_sends_getblocks_from_genesis() {
        let (peer, mut remote, chain) = peer_with_height(10);
        let listener = Arc::new(Mutex::new(DownloadListener::new()));
        let done = listener.lock().unwrap().subscribe();
        peer.add_event_listener(listener.clone());

        peer.start_block_chain_download().await.unwrap();
        assert!(peer.download_data());

        let Message::GetBlocks(getblocks) = remote.next_written().await else {
            panic!("expected getblocks");
        };
        assert_eq!(getblocks.locator, vec![chain.genesis_hash()]);
        assert!(getblocks.stop.is_zero());
        assert_eq!(getblocks.version, PROTOCOL_VERSION);
        assert!(!*done.borrow());

        let shared: SharedListener = listener;
        assert!(peer.remove_event_listener(&shared));
        assert!(!peer.remove_event_listener(&shared));
    }

    #[tokio::test]
    async fn test_no_download_when_peer_has_no_height() {
        let (peer, remote, _) = peer_with_height(0);
        peer.start_block_chain_download().await.unwrap();
        assert_eq!(peer.blocks_to_get().unwrap(), -1);
        assert!(remote.written().is_empty());
    }

    #[tokio::test]
    async fn test_inventory_ignored_until_download_enabled() {
        let (peer, mut remote, _) = peer_with_height(5);
        let handle = spawn_run(&peer);

        let inv = InventoryMessage::new(vec![InventoryItem::block(Hash256::new([7; 32]))]);
        remote.send(Message::Inventory(inv.clone()));
        remote.send(Message::Ping(Some(1)));
        assert!(matches!(remote.next_written().await, Message::Pong(1)));

        peer.set_download_data(true);
        let mut with_tx = inv.clone();
        with_tx.add_item(InventoryItem::transaction(Hash256::new([8; 32])));
        remote.send(Message::Inventory(with_tx));
        let Message::GetData(getdata) = remote.next_written().await else {
            panic!("expected getdata");
        };
        assert_eq!(getdata, inv);

        peer.disconnect().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unconnected_block_and_tickle_inventory() {
        let (peer, mut remote, chain) = peer_with_height(5);
        peer.set_download_data(true);
        let handle = spawn_run(&peer);

        let genesis = chain.params().genesis_block();
        let first = mine_block(&genesis, vec![]);
        let second = mine_block(&first, vec![]);
        let third = mine_block(&second, vec![]);

        remote.send(Message::Block(first.clone()));
        remote.send(Message::Block(third.clone()));
        let Message::GetBlocks(getblocks) = remote.next_written().await else {
            panic!("expected getblocks for the orphan");
        };
        assert_eq!(getblocks.stop, third.hash());
        assert_eq!(getblocks.locator, vec![first.hash(), chain.genesis_hash()]);
        assert_eq!(chain.unconnected_block(), Some(third.hash()));

        remote.send(Message::Inventory(InventoryMessage::new(vec![InventoryItem::block(third.hash())])));
        let Message::GetBlocks(getblocks) = remote.next_written().await else {
            panic!("tickle inv must produce getblocks, not getdata");
        };
        assert_eq!(getblocks.locator[0], chain.chain_head().unwrap().hash());
        assert_eq!(getblocks.stop, third.hash());

        remote.send(Message::Block(second.clone()));
        remote.send(Message::Ping(Some(3)));
        assert!(matches!(remote.next_written().await, Message::Pong(3)));
        assert_eq!(chain.best_height().unwrap(), 3);
        assert_eq!(chain.chain_head().unwrap().hash(), third.hash());

        peer.disconnect().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_get_block_requests_each_fulfilled_once() {
        let (peer, mut remote, chain) = peer_with_height(1);
        let handle = spawn_run(&peer);

        let block = mine_block(&chain.params().genesis_block(), vec![]);
        let first = peer.get_block(block.hash()).await.unwrap();
        let second = peer.get_block(block.hash()).await.unwrap();

        for _ in 0..2 {
            let Message::GetData(getdata) = remote.next_written().await else {
                panic!("expected getdata");
            };
            assert_eq!(getdata.items, vec![InventoryItem::block(block.hash())]);
        }

        remote.send(Message::Block(block.clone()));
        assert_eq!(first.wait_timeout(Duration::from_secs(5)).await.unwrap(), block);
        assert!(!second.is_done());

        remote.send(Message::Block(block.clone()));
        assert_eq!(second.wait_timeout(Duration::from_secs(5)).await.unwrap(), block);

        // requested blocks are handed to the caller, not the chain
        assert_eq!(chain.best_height().unwrap(), 0);

        peer.disconnect().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_rejects_coinbase() {
        let (peer, mut remote, chain) = peer_with_height(0);
        let block = mine_block(&chain.params().genesis_block(), vec![]);
        let coinbase = block.transactions().unwrap()[0].clone();
        assert!(peer.broadcast_transaction(&coinbase).await.is_err());

        let mut spend = Transaction::new();
        spend.add_input_from(&coinbase, 0).unwrap();
        spend.add_output(1000, vec![0x51]).unwrap();
        peer.broadcast_transaction(&spend).await.unwrap();
        let Message::Transaction(sent) = remote.next_written().await else {
            panic!("expected tx");
        };
        assert_eq!(sent.hash(), spend.hash());
    }
}
