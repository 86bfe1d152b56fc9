// Network layer: wire messages, transport and the peer session

mod address;
mod inventory;
mod listener;
mod message;
mod peer;
mod pending;
mod transport;

pub use address::{AddressMessage, PeerAddress, MAX_ADDRESSES};
pub use inventory::{InventoryItem, InventoryKind, InventoryMessage, MAX_INVENTORY_ITEMS};
pub use listener::{DownloadListener, PeerEventListener};
pub use message::{
    DecodeOptions, GetBlocksMessage, Message, MessageHeader, MessageType, VersionMessage, MAX_MESSAGE_SIZE,
};
pub use peer::{Peer, PeerConfig, PeerInfo, PeerState, SharedListener};
pub use pending::PendingBlock;
pub(crate) use pending::PendingRequest;
pub use transport::{TcpTransport, Transport};
