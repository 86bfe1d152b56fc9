// Bitcoin Script implementation (simplified for P2PKH)

use crate::core::{hash160, Hash256};
use crate::error::{Error, Result};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};

/// Opcodes used by the standard scripts we build and read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Next byte holds the push length
    OpPushData1 = 0x4c,
    /// Duplicate the top stack item
    OpDup = 0x76,
    /// Hash the top stack item with HASH160
    OpHash160 = 0xa9,
    /// Push 20 bytes (pubkey hash size)
    OpPushBytes20 = 0x14,
    /// Verify that the top two items are equal
    OpEqualVerify = 0x88,
    /// Check signature
    OpCheckSig = 0xac,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x4c => Some(OpCode::OpPushData1),
            0x76 => Some(OpCode::OpDup),
            0xa9 => Some(OpCode::OpHash160),
            0x14 => Some(OpCode::OpPushBytes20),
            0x88 => Some(OpCode::OpEqualVerify),
            0xac => Some(OpCode::OpCheckSig),
            _ => None,
        }
    }
}

/// Script builder and reader for pay-to-pubkey-hash
pub struct Script;

impl Script {
    /// Append a data push. Short pushes use the length as the opcode.
    pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
        if data.len() < OpCode::OpPushData1 as usize {
            script.push(data.len() as u8);
        } else {
            script.push(OpCode::OpPushData1 as u8);
            script.push(data.len() as u8);
        }
        script.extend_from_slice(data);
    }

    /// Create a P2PKH scriptPubKey
    /// OP_DUP OP_HASH160 <pubKeyHash> OP_EQUALVERIFY OP_CHECKSIG
    pub fn p2pkh_script_pubkey(pubkey_hash: &[u8; 20]) -> Vec<u8> {
        let mut script = Vec::with_capacity(25);
        script.push(OpCode::OpDup as u8);
        script.push(OpCode::OpHash160 as u8);
        script.push(OpCode::OpPushBytes20 as u8);
        script.extend_from_slice(pubkey_hash);
        script.push(OpCode::OpEqualVerify as u8);
        script.push(OpCode::OpCheckSig as u8);
        script
    }

    /// Pay-to-pubkey scriptPubKey: <pubkey> OP_CHECKSIG. Only the genesis
    /// coinbase uses this form here.
    pub fn p2pk_script_pubkey(pubkey: &[u8]) -> Vec<u8> {
        let mut script = Vec::with_capacity(pubkey.len() + 2);
        Self::push_data(&mut script, pubkey);
        script.push(OpCode::OpCheckSig as u8);
        script
    }

    /// Create a P2PKH scriptSig
    /// <signature || hash type> <pubkey>
    pub fn p2pkh_script_sig(signature: &[u8], pubkey: &[u8]) -> Vec<u8> {
        let mut script = Vec::with_capacity(signature.len() + pubkey.len() + 2);
        Self::push_data(&mut script, signature);
        Self::push_data(&mut script, pubkey);
        script
    }

    /// Split a script into its data pushes. Fails on anything that is not a push.
    pub fn parse_pushes(script: &[u8]) -> Result<Vec<&[u8]>> {
        let mut chunks = Vec::new();
        let mut pos = 0;

        while pos < script.len() {
            let opcode = script[pos];
            pos += 1;

            let len = match opcode {
                1..=0x4b => opcode as usize,
                0x4c => {
                    let len = *script
                        .get(pos)
                        .ok_or_else(|| Error::malformed("truncated OP_PUSHDATA1"))?;
                    pos += 1;
                    len as usize
                }
                other => {
                    return Err(Error::malformed(format!("unexpected opcode 0x{:02x} in push-only script", other)));
                }
            };

            let chunk = script
                .get(pos..pos + len)
                .ok_or_else(|| Error::malformed(format!("push of {} bytes runs past end of script", len)))?;
            chunks.push(chunk);
            pos += len;
        }

        Ok(chunks)
    }

    /// Parse scriptSig: <sig || hash type> <pubkey>
    pub fn parse_script_sig(script_sig: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        match Self::parse_pushes(script_sig)?.as_slice() {
            [signature, pubkey] => Ok((signature.to_vec(), pubkey.to_vec())),
            pushes => Err(Error::malformed(format!(
                "expected signature and public key, found {} pushes",
                pushes.len()
            ))),
        }
    }

    /// Extract the public key hash from a P2PKH scriptPubKey
    pub fn pubkey_hash(script_pubkey: &[u8]) -> Result<[u8; 20]> {
        let is_p2pkh = script_pubkey.len() == 25
            && script_pubkey[0] == OpCode::OpDup as u8
            && script_pubkey[1] == OpCode::OpHash160 as u8
            && script_pubkey[2] == OpCode::OpPushBytes20 as u8
            && script_pubkey[23] == OpCode::OpEqualVerify as u8
            && script_pubkey[24] == OpCode::OpCheckSig as u8;

        if !is_p2pkh {
            return Err(Error::malformed(format!(
                "not a pay-to-pubkey-hash script: {}",
                hex::encode(script_pubkey)
            )));
        }

        let mut pubkey_hash = [0u8; 20];
        pubkey_hash.copy_from_slice(&script_pubkey[3..23]);
        Ok(pubkey_hash)
    }

    /// Verify a P2PKH spend against the signature hash of the spending input.
    /// The trailing hash type byte of the signature push is not part of the DER.
    pub fn verify_p2pkh(script_sig: &[u8], script_pubkey: &[u8], sighash: &Hash256) -> Result<bool> {
        let (signature, pubkey) = Self::parse_script_sig(script_sig)?;
        let pubkey_hash = Self::pubkey_hash(script_pubkey)?;

        if hash160(&pubkey) != pubkey_hash {
            return Ok(false);
        }

        let Some((_hash_type, der)) = signature.split_last() else {
            return Err(Error::malformed("empty signature push"));
        };

        Self::verify_signature(der, &pubkey, sighash)
    }

    /// Verify ECDSA signature
    fn verify_signature(der: &[u8], pubkey: &[u8], sighash: &Hash256) -> Result<bool> {
        let secp = Secp256k1::verification_only();

        let pubkey = PublicKey::from_slice(pubkey)
            .map_err(|e| Error::malformed(format!("invalid public key: {}", e)))?;
        let signature = Signature::from_der(der)
            .map_err(|e| Error::malformed(format!("invalid signature: {}", e)))?;
        let message = Message::from_digest(*sighash.as_bytes());

        Ok(secp.verify_ecdsa(&message, &signature, &pubkey).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::rand::rngs::OsRng;
    use secp256k1::SecretKey;

    fn signed_spend(signer: &SecretKey, owner_hash: [u8; 20], sighash: &Hash256) -> (Vec<u8>, Vec<u8>) {
        let secp = Secp256k1::new();
        let pubkey = signer.public_key(&secp).serialize();

        let message = Message::from_digest(*sighash.as_bytes());
        let mut signature = secp.sign_ecdsa(&message, signer).serialize_der().to_vec();
        signature.push(0x01);

        (
            Script::p2pkh_script_sig(&signature, &pubkey),
            Script::p2pkh_script_pubkey(&owner_hash),
        )
    }

    #[test]
    fn test_p2pkh_script_creation() {
        let pubkey_hash = [0x12; 20];
        let script = Script::p2pkh_script_pubkey(&pubkey_hash);

        assert_eq!(script.len(), 25);
        assert_eq!(script[0], OpCode::OpDup as u8);
        assert_eq!(&script[3..23], &pubkey_hash);
        assert_eq!(script[24], OpCode::OpCheckSig as u8);
        assert_eq!(Script::pubkey_hash(&script).unwrap(), pubkey_hash);
    }

    #[test]
    fn test_script_sig_round_trip() {
        let signature = vec![0x30; 71];
        let pubkey = vec![0x02; 33];

        let script_sig = Script::p2pkh_script_sig(&signature, &pubkey);
        assert_eq!(script_sig[0], 71);
        assert_eq!(script_sig.len(), 1 + 71 + 1 + 33);

        let (sig, key) = Script::parse_script_sig(&script_sig).unwrap();
        assert_eq!(sig, signature);
        assert_eq!(key, pubkey);
    }

    #[test]
    fn test_long_push_uses_pushdata1() {
        let pubkey = vec![0x04; 65];
        let long = vec![0xaa; 80];
        let script = Script::p2pkh_script_sig(&long, &pubkey);
        assert_eq!(&script[..2], &[0x4c, 80]);
        assert_eq!(Script::parse_pushes(&script).unwrap(), vec![&long[..], &pubkey[..]]);
    }

    #[test]
    fn test_malformed_scripts() {
        assert!(Script::parse_script_sig(&[]).is_err());
        assert!(Script::parse_script_sig(&[0x05, 0x01]).is_err());
        assert!(Script::parse_pushes(&[0x76]).is_err());
        assert!(Script::pubkey_hash(&[0u8; 25]).is_err());
    }

    #[test]
    fn test_full_p2pkh_verification() {
        let secp = Secp256k1::new();
        let key = SecretKey::new(&mut OsRng);
        let owner_hash = hash160(&key.public_key(&secp).serialize());
        let sighash = Hash256::new([0x42; 32]);

        let (script_sig, script_pubkey) = signed_spend(&key, owner_hash, &sighash);
        assert!(Script::verify_p2pkh(&script_sig, &script_pubkey, &sighash).unwrap());

        let other = Hash256::new([0x43; 32]);
        assert!(!Script::verify_p2pkh(&script_sig, &script_pubkey, &other).unwrap());
    }

    #[test]
    fn test_p2pkh_verification_wrong_key() {
        let secp = Secp256k1::new();
        let owner = SecretKey::new(&mut OsRng);
        let thief = SecretKey::new(&mut OsRng);
        let owner_hash = hash160(&owner.public_key(&secp).serialize());
        let sighash = Hash256::new([0x42; 32]);

        // pubkey hash mismatch
        let (script_sig, script_pubkey) = signed_spend(&thief, owner_hash, &sighash);
        assert!(!Script::verify_p2pkh(&script_sig, &script_pubkey, &sighash).unwrap());
    }
}
