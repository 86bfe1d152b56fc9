// Fixtures shared by unit tests: fake funding, a mining helper and an
// in-memory transport

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::consensus::Miner;
use crate::core::{
    Block, BlockHeader, Hash256, NetworkParams, OutPoint, Script, Transaction, TxInput, TxOutput, PROTOCOL_VERSION,
};
use crate::error::{Error, Result};
use crate::network::{Message, Transport, VersionMessage};
use crate::storage::{BlockChain, BlockStore, MemoryBlockStore};
use crate::wallet::{KeyPair, WalletView};

static COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A transaction paying `value` to `pubkey_hash`, spending an outpoint that
/// does not exist. Every call returns a different transaction.
pub(crate) fn fake_funding_tx(pubkey_hash: [u8; 20], value: u64) -> Transaction {
    let mut source = [0xfa; 32];
    source[..4].copy_from_slice(&next_id().to_le_bytes());

    let mut tx = Transaction::new();
    tx.add_input(TxInput::new(OutPoint::new(Hash256::new(source), 0), vec![0x51]))
        .unwrap();
    tx.add_output(value, Script::p2pkh_script_pubkey(&pubkey_hash)).unwrap();
    tx
}

/// A minimal [`WalletView`] with one key and hand-managed outputs
pub(crate) struct TestWallet {
    key: KeyPair,
    outputs: HashMap<OutPoint, TxOutput>,
    spent: HashSet<OutPoint>,
}

impl TestWallet {
    pub(crate) fn with_new_key() -> Self {
        Self {
            key: KeyPair::generate(),
            outputs: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    pub(crate) fn key(&self) -> &KeyPair {
        &self.key
    }

    pub(crate) fn add_unspent(&mut self, tx: Transaction) {
        let hash = tx.hash();
        for (index, output) in tx.outputs().unwrap().iter().enumerate() {
            self.outputs.insert(OutPoint::new(hash, index as u32), output.clone());
        }
    }

    pub(crate) fn mark_spent(&mut self, outpoint: OutPoint) {
        self.spent.insert(outpoint);
    }
}

impl WalletView for TestWallet {
    fn find_key_from_pub_hash(&self, pubkey_hash: &[u8; 20]) -> Option<&KeyPair> {
        (self.key.pubkey_hash() == *pubkey_hash).then_some(&self.key)
    }

    fn connected_output(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.outputs.get(outpoint)
    }

    fn is_output_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains(outpoint)
    }

    fn balance(&self) -> u64 {
        self.outputs
            .iter()
            .filter(|(outpoint, _)| !self.spent.contains(outpoint))
            .map(|(_, output)| output.value)
            .sum()
    }
}

/// An empty chain on the unit-test network
pub(crate) fn unit_test_chain() -> (BlockChain, NetworkParams) {
    let params = NetworkParams::unit_test();
    let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new(&params));
    (BlockChain::new(params.clone(), store), params)
}

/// Mine a block on top of `prev`: a unique coinbase followed by `extra_txs`
pub(crate) fn mine_block(prev: &Block, extra_txs: Vec<Transaction>) -> Block {
    let coinbase = Transaction::coinbase(next_id().to_le_bytes().to_vec(), TxOutput::new(5_000_000_000, vec![0x51]));
    mine_with_coinbase(prev, coinbase, extra_txs)
}

/// Mine a block whose coinbase pays `value` to `pubkey_hash`
pub(crate) fn mine_block_paying(prev: &Block, pubkey_hash: [u8; 20], value: u64) -> Block {
    let coinbase = Transaction::coinbase(
        next_id().to_le_bytes().to_vec(),
        TxOutput::new(value, Script::p2pkh_script_pubkey(&pubkey_hash)),
    );
    mine_with_coinbase(prev, coinbase, vec![])
}

fn mine_with_coinbase(prev: &Block, coinbase: Transaction, extra_txs: Vec<Transaction>) -> Block {
    let mut txs = vec![coinbase];
    txs.extend(extra_txs);

    let mut header = BlockHeader::new(
        1,
        prev.hash(),
        Block::calculate_merkle_root(&txs),
        prev.header.timestamp + 600,
        prev.header.bits,
        0,
    );
    assert!(Miner::new(header.bits).mine(&mut header).success);
    Block::new(header, txs)
}

/// In-memory [`Transport`]. The test drives the remote side through the
/// paired [`MockRemote`].
pub(crate) struct MockTransport {
    version: VersionMessage,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Message>>>,
    outbound: mpsc::UnboundedSender<Message>,
    written: Arc<Mutex<Vec<Message>>>,
    closed: AtomicBool,
}

pub(crate) struct MockRemote {
    inbound: mpsc::UnboundedSender<Result<Message>>,
    outbound: mpsc::UnboundedReceiver<Message>,
    written: Arc<Mutex<Vec<Message>>>,
}

impl MockTransport {
    /// A transport whose remote side advertised `start_height`
    pub(crate) fn new(start_height: i32) -> (Self, MockRemote) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));

        let mut version = VersionMessage::new("127.0.0.1:18444".parse().unwrap(), "/mock/", 0);
        version.version = PROTOCOL_VERSION;
        version.start_height = start_height;

        let transport = Self {
            version,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            outbound: outbound_tx,
            written: Arc::clone(&written),
            closed: AtomicBool::new(false),
        };
        let remote = MockRemote {
            inbound: inbound_tx,
            outbound: outbound_rx,
            written,
        };
        (transport, remote)
    }
}

impl Transport for MockTransport {
    async fn read_message(&self) -> Result<Message> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(result) => result,
            None => Err(Error::PeerDisconnected("mock remote dropped".to_string())),
        }
    }

    async fn write_message(&self, message: &Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PeerDisconnected("mock transport closed".to_string()));
        }
        self.written.lock().unwrap().push(message.clone());
        let _ = self.outbound.send(message.clone());
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn peer_version(&self) -> &VersionMessage {
        &self.version
    }
}

impl MockRemote {
    /// Deliver a message to the peer's read loop
    pub(crate) fn send(&self, message: Message) {
        self.inbound.send(Ok(message)).unwrap();
    }

    /// Make the next read fail with `error`
    pub(crate) fn send_error(&self, error: Error) {
        self.inbound.send(Err(error)).unwrap();
    }

    /// Simulate the connection dropping
    pub(crate) fn fail(&self, reason: &str) {
        self.send_error(Error::PeerDisconnected(reason.to_string()));
    }

    /// Next message the peer wrote, failing the test after a few seconds
    pub(crate) async fn next_written(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("peer wrote nothing")
            .expect("transport dropped")
    }

    /// Everything written so far
    pub(crate) fn written(&self) -> Vec<Message> {
        self.written.lock().unwrap().clone()
    }
}
