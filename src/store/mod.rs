use crate::error::{Error, Result};
use crate::signal::prekey::{PreKey, SignedPreKey};
use crate::signal::record::SessionRecord;
use crate::types::ProtocolAddress;
use crate::util::keys::KeyPair;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage capability set the protocol core runs against.
///
/// These are the only suspension points of the core; everything else is
/// synchronous. Absence of a session or prekey is normal and reported as
/// `None`, not as an error.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    /// Load the session record for an address
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>>;

    /// Persist the session record for an address
    async fn store_session(&self, address: &ProtocolAddress, record: &SessionRecord)
        -> Result<()>;

    /// Whether the given identity key is acceptable for this identifier
    async fn is_trusted_identity(&self, id: &str, identity_key: &[u8]) -> Result<bool>;

    /// Load a one-time prekey by id
    async fn load_pre_key(&self, id: u32) -> Result<Option<PreKey>>;

    /// Remove a consumed one-time prekey
    async fn remove_pre_key(&self, id: u32) -> Result<()>;

    /// Load a signed prekey by id
    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKey>>;

    /// Our long-term identity key pair
    async fn get_our_identity(&self) -> Result<KeyPair>;

    /// Our 14-bit registration id
    async fn get_our_registration_id(&self) -> Result<u32>;
}

/// Trust level for remote identity keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustLevel {
    Trusted,
    #[default]
    Untrusted,
    Blocked,
}

/// In-memory store implementation.
///
/// Sessions are kept in their serialized document form, so every load and
/// store exercises the persisted representation.
pub struct MemoryStore {
    identity: KeyPair,
    registration_id: u32,
    sessions: RwLock<HashMap<String, String>>,
    pre_keys: RwLock<HashMap<u32, PreKey>>,
    signed_pre_keys: RwLock<HashMap<u32, SignedPreKey>>,
    identities: RwLock<HashMap<String, (Vec<u8>, TrustLevel)>>,
}

impl MemoryStore {
    pub fn new(identity: KeyPair, registration_id: u32) -> Self {
        Self {
            identity,
            registration_id,
            sessions: RwLock::new(HashMap::new()),
            pre_keys: RwLock::new(HashMap::new()),
            signed_pre_keys: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh store with generated identity material
    pub fn generate() -> Self {
        Self::new(
            crate::signal::prekey::generate_identity_key_pair(),
            crate::signal::prekey::generate_registration_id(),
        )
    }

    pub async fn store_pre_key(&self, pre_key: PreKey) {
        self.pre_keys.write().await.insert(pre_key.id, pre_key);
    }

    pub async fn store_signed_pre_key(&self, signed_pre_key: SignedPreKey) {
        self.signed_pre_keys
            .write()
            .await
            .insert(signed_pre_key.id, signed_pre_key);
    }

    /// Record an identity key for an identifier, defaulting to untrusted
    pub async fn save_identity(&self, id: &str, identity_key: &[u8]) {
        self.identities.write().await.insert(
            id.to_string(),
            (identity_key.to_vec(), TrustLevel::default()),
        );
    }

    pub async fn set_trust_level(&self, id: &str, trust_level: TrustLevel) -> Result<()> {
        match self.identities.write().await.get_mut(id) {
            Some(entry) => {
                entry.1 = trust_level;
                Ok(())
            }
            None => Err(Error::Storage(format!("No identity key found for {}", id))),
        }
    }
}

#[async_trait]
impl ProtocolStore for MemoryStore {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        match self.sessions.read().await.get(&address.to_string()) {
            Some(data) => Ok(Some(SessionRecord::deserialize(data)?)),
            None => Ok(None),
        }
    }

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<()> {
        let data = record.serialize()?;
        self.sessions
            .write()
            .await
            .insert(address.to_string(), data);
        Ok(())
    }

    async fn is_trusted_identity(&self, id: &str, identity_key: &[u8]) -> Result<bool> {
        match self.identities.read().await.get(id) {
            // A key is acceptable while it matches what we saw and is not blocked
            Some((known_key, trust_level)) => {
                Ok(known_key == identity_key && *trust_level != TrustLevel::Blocked)
            }
            // First contact
            None => Ok(true),
        }
    }

    async fn load_pre_key(&self, id: u32) -> Result<Option<PreKey>> {
        Ok(self.pre_keys.read().await.get(&id).cloned())
    }

    async fn remove_pre_key(&self, id: u32) -> Result<()> {
        self.pre_keys.write().await.remove(&id);
        Ok(())
    }

    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKey>> {
        Ok(self.signed_pre_keys.read().await.get(&id).cloned())
    }

    async fn get_our_identity(&self) -> Result<KeyPair> {
        Ok(self.identity.clone())
    }

    async fn get_our_registration_id(&self) -> Result<u32> {
        Ok(self.registration_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_storage_roundtrip() {
        let store = MemoryStore::generate();
        let address = ProtocolAddress::new("alice", 1).unwrap();

        assert!(store.load_session(&address).await.unwrap().is_none());

        let record = SessionRecord::new();
        store.store_session(&address, &record).await.unwrap();
        let loaded = store.load_session(&address).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_pre_key_storage() {
        let store = MemoryStore::generate();
        let pre_key = PreKey::generate(7);

        store.store_pre_key(pre_key.clone()).await;
        assert_eq!(store.load_pre_key(7).await.unwrap(), Some(pre_key));

        store.remove_pre_key(7).await.unwrap();
        assert!(store.load_pre_key(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identity_trust() {
        let store = MemoryStore::generate();
        let key_a = vec![5u8; 33];
        let key_b = vec![6u8; 33];

        // Unknown identifiers are trusted on first use
        assert!(store.is_trusted_identity("alice", &key_a).await.unwrap());

        store.save_identity("alice", &key_a).await;
        assert!(store.is_trusted_identity("alice", &key_a).await.unwrap());
        // A changed key is not
        assert!(!store.is_trusted_identity("alice", &key_b).await.unwrap());

        store
            .set_trust_level("alice", TrustLevel::Blocked)
            .await
            .unwrap();
        assert!(!store.is_trusted_identity("alice", &key_a).await.unwrap());

        assert!(store.set_trust_level("bob", TrustLevel::Trusted).await.is_err());
    }

    #[tokio::test]
    async fn test_our_identity() {
        let store = MemoryStore::generate();
        let identity = store.get_our_identity().await.unwrap();
        assert_eq!(identity.public_key.len(), 33);
        assert!(store.get_our_registration_id().await.unwrap() <= 0x3fff);
    }
}
