//! Double Ratchet session state.
//!
//! A session carries one root key, one sending chain and any number of
//! receiving chains, each addressed by the ephemeral public key that
//! produced it. Receiving chains outlive their chain key so that cached
//! message keys can still decrypt late deliveries.

use crate::error::{Error, Result};
use crate::util::{crypto, keys, keys::KeyPair};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Hard bound on how far a chain may be advanced past its counter
const MAX_SKIPPED_KEYS: i64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainType {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseKeyType {
    Ours,
    Theirs,
}

/// Symmetric chain state: a 32-byte key plus the counter of the last
/// message key derived from it. Counter starts at -1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainKey {
    pub counter: i32,
    /// None once the chain has been closed and its key erased
    #[serde(with = "crate::util::serde_b64::opt")]
    pub key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub chain_type: ChainType,
    pub chain_key: ChainKey,
    /// Undelivered message-key seeds, indexed by message counter
    #[serde(with = "crate::util::serde_b64::u32_map")]
    pub message_keys: HashMap<u32, Vec<u8>>,
}

impl Chain {
    pub fn new(chain_type: ChainType, key: Vec<u8>) -> Self {
        Self {
            chain_type,
            chain_key: ChainKey {
                counter: -1,
                key: Some(key),
            },
            message_keys: HashMap::new(),
        }
    }

    /// Advance the chain until `counter` message keys have been derived.
    ///
    /// Every derived seed is parked in `message_keys` under its counter;
    /// consuming a seed is the caller's business.
    pub fn fill_message_keys(&mut self, counter: u32) -> Result<()> {
        let target = i64::from(counter);
        if i64::from(self.chain_key.counter) >= target {
            return Ok(());
        }
        if target - i64::from(self.chain_key.counter) > MAX_SKIPPED_KEYS {
            return Err(Error::Session(
                "Over 2000 messages into the future".to_string(),
            ));
        }

        while i64::from(self.chain_key.counter) < target {
            let key = self
                .chain_key
                .key
                .as_ref()
                .ok_or_else(|| Error::Session("Chain closed".to_string()))?;

            let seed = crypto::hmac_sha256(key, &[0x01])?;
            let next = crypto::hmac_sha256(key, &[0x02])?;

            self.message_keys
                .insert((self.chain_key.counter + 1) as u32, seed.to_vec());
            self.chain_key.key = Some(next.to_vec());
            self.chain_key.counter += 1;
        }
        Ok(())
    }

    /// Erase the chain key, leaving cached message keys for late arrivals
    pub fn close(&mut self) {
        if let Some(key) = self.chain_key.key.as_mut() {
            key.zeroize();
        }
        self.chain_key.key = None;
    }

    pub fn is_closed(&self) -> bool {
        self.chain_key.key.is_none()
    }
}

/// Per-message key material expanded from a chain's message-key seed
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
}

impl MessageKeys {
    pub fn derive(seed: &[u8]) -> Result<Self> {
        let parts = crypto::hkdf(seed, &[0u8; 32], b"WhisperMessageKeys", 3)?;
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&parts[2][..16]);
        Ok(Self {
            cipher_key: parts[0],
            mac_key: parts[1],
            iv,
        })
    }
}

/// The asymmetric half of the ratchet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentRatchet {
    #[serde(with = "crate::util::serde_b64")]
    pub root_key: Vec<u8>,
    pub ephemeral_key_pair: KeyPair,
    #[serde(with = "crate::util::serde_b64")]
    pub last_remote_ephemeral_key: Vec<u8>,
    pub previous_counter: u32,
}

/// Bookkeeping identifying a session within its record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    #[serde(with = "crate::util::serde_b64")]
    pub base_key: Vec<u8>,
    pub base_key_type: BaseKeyType,
    /// -1 while the session is open, close timestamp (ms) otherwise
    pub closed: i64,
    pub used: i64,
    pub created: i64,
    #[serde(with = "crate::util::serde_b64")]
    pub remote_identity_key: Vec<u8>,
}

/// Memo of the prekey bundle used to start an outbound session; echoed
/// on every outbound frame until the peer's first reply lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub signed_key_id: u32,
    pub pre_key_id: Option<u32>,
    #[serde(with = "crate::util::serde_b64")]
    pub base_key: Vec<u8>,
}

/// One Double Ratchet session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// The peer's registration id, when known
    pub registration_id: Option<u32>,
    pub current_ratchet: CurrentRatchet,
    pub index_info: IndexInfo,
    pub pending_pre_key: Option<PendingPreKey>,
    /// Chains keyed by the base64 form of the producing ephemeral key
    pub chains: HashMap<String, Chain>,
}

fn chain_id(ephemeral_key: &[u8]) -> String {
    STANDARD.encode(ephemeral_key)
}

impl SessionState {
    pub fn chain(&self, ephemeral_key: &[u8]) -> Option<&Chain> {
        self.chains.get(&chain_id(ephemeral_key))
    }

    pub fn chain_mut(&mut self, ephemeral_key: &[u8]) -> Option<&mut Chain> {
        self.chains.get_mut(&chain_id(ephemeral_key))
    }

    pub fn add_chain(&mut self, ephemeral_key: &[u8], chain: Chain) {
        self.chains.insert(chain_id(ephemeral_key), chain);
    }

    pub fn delete_chain(&mut self, ephemeral_key: &[u8]) {
        self.chains.remove(&chain_id(ephemeral_key));
    }

    /// The chain we encrypt on: the one under our current ratchet key
    pub fn sending_chain_mut(&mut self) -> Option<&mut Chain> {
        let id = chain_id(&self.current_ratchet.ephemeral_key_pair.public_key);
        self.chains.get_mut(&id)
    }

    /// One DH ratchet turn: mix the agreement between `remote_key` and our
    /// current ratchet key into the root key and install the fresh chain.
    pub fn calculate_ratchet(&mut self, remote_key: &[u8], sending: bool) -> Result<()> {
        let shared_secret = keys::calculate_agreement(
            remote_key,
            &self.current_ratchet.ephemeral_key_pair.private_key,
        )?;
        let master_key = crypto::hkdf(
            &shared_secret,
            &self.current_ratchet.root_key,
            b"WhisperRatchet",
            2,
        )?;

        let (chain_owner, chain_type) = if sending {
            (
                self.current_ratchet.ephemeral_key_pair.public_key.clone(),
                ChainType::Sending,
            )
        } else {
            (remote_key.to_vec(), ChainType::Receiving)
        };
        self.add_chain(&chain_owner, Chain::new(chain_type, master_key[1].to_vec()));
        self.current_ratchet.root_key = master_key[0].to_vec();
        Ok(())
    }

    /// Step the DH ratchet if the peer moved to a new ephemeral key.
    ///
    /// Closes the previous receiving chain at `previous_counter`, installs
    /// the receiving chain for `remote_key`, then rotates our own ratchet
    /// key and installs the next sending chain.
    pub fn maybe_step_ratchet(&mut self, remote_key: &[u8], previous_counter: u32) -> Result<()> {
        if self.chain(remote_key).is_some() {
            return Ok(());
        }

        tracing::debug!(
            remote_key = %hex::encode(&remote_key[..remote_key.len().min(8)]),
            "stepping DH ratchet for new remote ephemeral key"
        );

        let last_remote = self.current_ratchet.last_remote_ephemeral_key.clone();
        if let Some(previous) = self.chain_mut(&last_remote) {
            previous.fill_message_keys(previous_counter)?;
            previous.close();
        }

        self.calculate_ratchet(remote_key, false)?;

        let our_ratchet_key = self.current_ratchet.ephemeral_key_pair.public_key.clone();
        if let Some(counter) = self.chain(&our_ratchet_key).map(|c| c.chain_key.counter) {
            self.current_ratchet.previous_counter = counter.max(0) as u32;
            self.delete_chain(&our_ratchet_key);
        }

        self.current_ratchet.ephemeral_key_pair = KeyPair::generate();
        self.calculate_ratchet(remote_key, true)?;
        self.current_ratchet.last_remote_ephemeral_key = remote_key.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiving_chain(key: u8) -> Chain {
        Chain::new(ChainType::Receiving, vec![key; 32])
    }

    fn test_session(remote: &KeyPair) -> SessionState {
        let ours = KeyPair::generate();
        let mut session = SessionState {
            registration_id: Some(0x1234),
            current_ratchet: CurrentRatchet {
                root_key: vec![7u8; 32],
                ephemeral_key_pair: ours.clone(),
                last_remote_ephemeral_key: remote.public_key.clone(),
                previous_counter: 0,
            },
            index_info: IndexInfo {
                base_key: ours.public_key.clone(),
                base_key_type: BaseKeyType::Ours,
                closed: -1,
                used: 1,
                created: 1,
                remote_identity_key: KeyPair::generate().public_key.clone(),
            },
            pending_pre_key: None,
            chains: HashMap::new(),
        };
        session.add_chain(&remote.public_key, receiving_chain(1));
        session.add_chain(
            &ours.public_key.clone(),
            Chain::new(ChainType::Sending, vec![2u8; 32]),
        );
        session
    }

    #[test]
    fn test_fill_message_keys_advances_counter() {
        let mut chain = receiving_chain(3);
        chain.fill_message_keys(4).unwrap();

        assert_eq!(chain.chain_key.counter, 4);
        assert_eq!(chain.message_keys.len(), 5);
        for counter in 0..=4u32 {
            assert!(chain.message_keys.contains_key(&counter));
        }
    }

    #[test]
    fn test_fill_message_keys_matches_hmac_schedule() {
        let mut chain = receiving_chain(3);
        chain.fill_message_keys(1).unwrap();

        let seed0 = crypto::hmac_sha256(&[3u8; 32], &[0x01]).unwrap();
        let next = crypto::hmac_sha256(&[3u8; 32], &[0x02]).unwrap();
        let seed1 = crypto::hmac_sha256(&next, &[0x01]).unwrap();

        assert_eq!(chain.message_keys[&0], seed0.to_vec());
        assert_eq!(chain.message_keys[&1], seed1.to_vec());
    }

    #[test]
    fn test_fill_message_keys_is_idempotent_below_counter() {
        let mut chain = receiving_chain(3);
        chain.fill_message_keys(2).unwrap();
        let snapshot = chain.clone();

        chain.fill_message_keys(1).unwrap();
        assert_eq!(chain, snapshot);
    }

    #[test]
    fn test_fill_message_keys_future_bound() {
        let mut chain = receiving_chain(3);
        let result = chain.fill_message_keys(2000);
        assert!(result.is_err());

        // One below the bound is fine
        let mut chain = receiving_chain(3);
        chain.fill_message_keys(1999).unwrap();
    }

    #[test]
    fn test_fill_message_keys_closed_chain() {
        let mut chain = receiving_chain(3);
        chain.fill_message_keys(0).unwrap();
        chain.close();

        assert!(chain.is_closed());
        // Cached keys survive the close
        assert!(chain.message_keys.contains_key(&0));
        assert!(matches!(chain.fill_message_keys(1), Err(Error::Session(_))));
    }

    #[test]
    fn test_derive_message_keys() {
        let seed = [9u8; 32];
        let keys_a = MessageKeys::derive(&seed).unwrap();
        let keys_b = MessageKeys::derive(&seed).unwrap();

        assert_eq!(keys_a.cipher_key, keys_b.cipher_key);
        assert_eq!(keys_a.mac_key, keys_b.mac_key);
        assert_eq!(keys_a.iv, keys_b.iv);
        assert_ne!(keys_a.cipher_key, keys_a.mac_key);
    }

    #[test]
    fn test_ratchet_step_installs_and_closes_chains() {
        let remote0 = KeyPair::generate();
        let remote1 = KeyPair::generate();
        let mut session = test_session(&remote0);
        let old_sending_key = session.current_ratchet.ephemeral_key_pair.public_key.clone();

        session.maybe_step_ratchet(&remote1.public_key, 2).unwrap();

        // Old receiving chain closed at previous counter with keys cached
        let old_chain = session.chain(&remote0.public_key).unwrap();
        assert!(old_chain.is_closed());
        assert_eq!(old_chain.message_keys.len(), 3);

        // New receiving chain installed for the new remote key
        let new_chain = session.chain(&remote1.public_key).unwrap();
        assert_eq!(new_chain.chain_type, ChainType::Receiving);
        assert_eq!(new_chain.chain_key.counter, -1);

        // Our ratchet key rotated, old sending chain deleted
        assert!(session.chain(&old_sending_key).is_none());
        let new_sending_key = session.current_ratchet.ephemeral_key_pair.public_key.clone();
        assert_ne!(new_sending_key, old_sending_key);
        let sending = session.chain(&new_sending_key).unwrap();
        assert_eq!(sending.chain_type, ChainType::Sending);
        assert_eq!(sending.chain_key.counter, -1);

        assert_eq!(session.current_ratchet.last_remote_ephemeral_key, remote1.public_key);
    }

    #[test]
    fn test_ratchet_step_is_noop_for_known_key() {
        let remote0 = KeyPair::generate();
        let mut session = test_session(&remote0);
        let snapshot = session.clone();

        session.maybe_step_ratchet(&remote0.public_key, 5).unwrap();
        assert_eq!(session, snapshot);
    }

    #[test]
    fn test_session_state_serde_roundtrip() {
        let remote = KeyPair::generate();
        let mut session = test_session(&remote);
        session.pending_pre_key = Some(PendingPreKey {
            signed_key_id: 1,
            pre_key_id: Some(7),
            base_key: session.index_info.base_key.clone(),
        });
        session
            .chain_mut(&remote.public_key)
            .unwrap()
            .fill_message_keys(3)
            .unwrap();

        let encoded = serde_json::to_string(&session).unwrap();
        let decoded: SessionState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(session, decoded);
    }
}
