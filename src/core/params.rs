// Network parameters: magic bytes, ports, address versions and genesis

use crate::core::{Block, Hash256};

/// Protocol version we speak and advertise in `version`
pub const PROTOCOL_VERSION: u32 = 31800;

/// Peers above this version send a timestamp with every `addr` entry
pub const ADDRESS_TIME_VERSION: u32 = 31402;

/// Which chain a peer belongs to. Everything that differs between the
/// production network, the test network and the local unit-test network
/// lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub name: &'static str,
    /// First four bytes of every frame
    pub magic: [u8; 4],
    pub port: u16,
    /// Base58Check version byte for pay-to-pubkey-hash addresses
    pub address_header: u8,
    /// Easiest target allowed, in compact form
    pub proof_of_work_limit: u32,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
}

impl NetworkParams {
    /// Production network
    pub fn main() -> Self {
        Self {
            name: "main",
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            port: 8333,
            address_header: 0,
            proof_of_work_limit: 0x1d00ffff,
            genesis_time: 1231006505,
            genesis_bits: 0x1d00ffff,
            genesis_nonce: 2083236893,
        }
    }

    /// Public test network (testnet3)
    pub fn testnet() -> Self {
        Self {
            name: "testnet",
            magic: [0x0b, 0x11, 0x09, 0x07],
            port: 18333,
            address_header: 111,
            proof_of_work_limit: 0x1d00ffff,
            genesis_time: 1296688602,
            genesis_bits: 0x1d00ffff,
            genesis_nonce: 414098458,
        }
    }

    /// Local network with a trivially easy target, so tests can mine blocks
    pub fn unit_test() -> Self {
        Self {
            name: "unit_test",
            magic: [0x0b, 0x11, 0x09, 0x07],
            port: 18333,
            address_header: 111,
            proof_of_work_limit: 0x207fffff,
            genesis_time: 1296688602,
            genesis_bits: 0x207fffff,
            genesis_nonce: 2,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "main" | "mainnet" => Some(Self::main()),
            "test" | "testnet" => Some(Self::testnet()),
            "unit_test" | "unittest" => Some(Self::unit_test()),
            _ => None,
        }
    }

    pub fn genesis_block(&self) -> Block {
        Block::genesis(self)
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_block().hash()
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self::main()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_genesis_hash() {
        assert_eq!(
            NetworkParams::main().genesis_hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_testnet_genesis_hash() {
        assert_eq!(
            NetworkParams::testnet().genesis_hash().to_hex(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
    }

    #[test]
    fn test_from_name() {
        assert_eq!(NetworkParams::from_name("testnet").unwrap().address_header, 111);
        assert_eq!(NetworkParams::from_name("main").unwrap().port, 8333);
        assert!(NetworkParams::from_name("regtest").is_none());
    }
}
