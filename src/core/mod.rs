// Core blockchain data structures and wire codec

mod types;
mod transaction;
mod block;
mod hash;
pub mod params;
pub mod serialize;
pub mod script;

pub use types::*;
pub use transaction::*;
pub use block::*;
pub use hash::*;
pub use params::{NetworkParams, PROTOCOL_VERSION};
pub use serialize::{Decodable, Encodable};
pub use script::Script;
