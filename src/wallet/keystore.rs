// Key management and Base58Check addresses

use std::fmt;

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::core::{double_hash, hash160, Hash256, NetworkParams, Script};
use crate::error::{Error, Result};

/// Pay-to-pubkey-hash address: version byte plus HASH160 of a public key,
/// rendered as Base58Check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub version: u8,
    pub hash: [u8; 20],
}

impl Address {
    pub fn from_pubkey_hash(params: &NetworkParams, hash: [u8; 20]) -> Self {
        Self {
            version: params.address_header,
            hash,
        }
    }

    /// Parse a Base58Check address, checking the checksum and that it
    /// belongs to the given network.
    pub fn parse(params: &NetworkParams, s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))?;
        if bytes.len() != 25 {
            return Err(Error::InvalidAddress(format!("{}: decodes to {} bytes", s, bytes.len())));
        }

        let (payload, checksum) = bytes.split_at(21);
        if double_hash(payload).as_bytes()[..4] != *checksum {
            return Err(Error::InvalidAddress(format!("{}: bad checksum", s)));
        }
        if payload[0] != params.address_header {
            return Err(Error::InvalidAddress(format!(
                "{}: version {} is not valid on {}",
                s, payload[0], params.name
            )));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Self { version: payload[0], hash })
    }

    /// P2PKH locking script paying to this address
    pub fn script_pubkey(&self) -> Vec<u8> {
        Script::p2pkh_script_pubkey(&self.hash)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bytes = Vec::with_capacity(25);
        bytes.push(self.version);
        bytes.extend_from_slice(&self.hash);
        let checksum = double_hash(&bytes);
        bytes.extend_from_slice(&checksum.as_bytes()[..4]);
        write!(f, "{}", bs58::encode(bytes).into_string())
    }
}

/// secp256k1 key pair. Public keys are always used in compressed form.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(&secp);
        Self { secret_key, public_key }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| Error::PreconditionViolation(format!("invalid secret key: {}", e)))?;
        let public_key = secret_key.public_key(&secp);
        Ok(Self { secret_key, public_key })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key_bytes())
    }

    pub fn address(&self, params: &NetworkParams) -> Address {
        Address::from_pubkey_hash(params, self.pubkey_hash())
    }

    /// Get script pubkey (P2PKH)
    pub fn script_pubkey(&self) -> Vec<u8> {
        Script::p2pkh_script_pubkey(&self.pubkey_hash())
    }

    /// DER-encoded ECDSA signature over a 32-byte digest
    pub fn sign(&self, digest: &Hash256) -> Vec<u8> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(*digest.as_bytes());
        secp.sign_ecdsa(&message, &self.secret_key).serialize_der().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyPair(pub:{})", hex::encode(self.public_key_bytes()))
    }
}
