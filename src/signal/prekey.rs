//! Prekey records and the key material helpers a client publishes.

use crate::error::Result;
use crate::util::keys::{self, KeyPair};
use serde::{Deserialize, Serialize};

/// One-time prekey; consumed the first time a PreKey message uses it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u32,
    pub key_pair: KeyPair,
}

impl PreKey {
    /// Generate a new one-time prekey with the given id
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            key_pair: KeyPair::generate(),
        }
    }
}

/// Medium-term prekey vouched for by the identity key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: KeyPair,
    #[serde(with = "crate::util::serde_b64")]
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    /// Generate a signed prekey, signing its public key with the identity key
    pub fn generate(id: u32, identity: &KeyPair) -> Result<Self> {
        let key_pair = KeyPair::generate();
        let signature = keys::calculate_signature(&identity.private_key, &key_pair.public_key)?;

        Ok(Self {
            id,
            key_pair,
            signature: signature.to_vec(),
        })
    }

    /// Verify the signature against the issuing identity key
    pub fn verify(&self, identity_public_key: &[u8]) -> bool {
        keys::verify_signature(identity_public_key, &self.key_pair.public_key, &self.signature)
    }
}

/// Public half of a signed prekey as carried in a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPublicPreKey {
    pub id: u32,
    #[serde(with = "crate::util::serde_b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::util::serde_b64")]
    pub signature: Vec<u8>,
}

/// Public half of a one-time prekey as carried in a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicPreKey {
    pub id: u32,
    #[serde(with = "crate::util::serde_b64")]
    pub public_key: Vec<u8>,
}

/// Everything a sender needs to construct a session unilaterally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    #[serde(with = "crate::util::serde_b64")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPublicPreKey,
    pub pre_key: Option<PublicPreKey>,
}

impl PreKeyBundle {
    /// Assemble a bundle from local key material
    pub fn new(
        registration_id: u32,
        identity: &KeyPair,
        signed_pre_key: &SignedPreKey,
        pre_key: Option<&PreKey>,
    ) -> Self {
        Self {
            registration_id,
            identity_key: identity.public_key.clone(),
            signed_pre_key: SignedPublicPreKey {
                id: signed_pre_key.id,
                public_key: signed_pre_key.key_pair.public_key.clone(),
                signature: signed_pre_key.signature.clone(),
            },
            pre_key: pre_key.map(|pre_key| PublicPreKey {
                id: pre_key.id,
                public_key: pre_key.key_pair.public_key.clone(),
            }),
        }
    }
}

/// Generate a long-term identity key pair
pub fn generate_identity_key_pair() -> KeyPair {
    KeyPair::generate()
}

/// Generate a 14-bit registration id in `1..=0x3fff`
pub fn generate_registration_id() -> u32 {
    u32::from(1 + rand::random::<u16>() % 0x3fff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prekey_generation() {
        let pre_key = PreKey::generate(7);
        assert_eq!(pre_key.id, 7);
        assert_eq!(pre_key.key_pair.public_key.len(), 33);
    }

    #[test]
    fn test_signed_prekey_verifies() {
        let identity = generate_identity_key_pair();
        let signed = SignedPreKey::generate(1, &identity).unwrap();

        assert!(signed.verify(&identity.public_key));

        let other = generate_identity_key_pair();
        assert!(!signed.verify(&other.public_key));
    }

    #[test]
    fn test_bundle_carries_public_halves() {
        let identity = generate_identity_key_pair();
        let signed = SignedPreKey::generate(1, &identity).unwrap();
        let pre_key = PreKey::generate(7);

        let bundle = PreKeyBundle::new(0x1234, &identity, &signed, Some(&pre_key));
        assert_eq!(bundle.registration_id, 0x1234);
        assert_eq!(bundle.identity_key, identity.public_key);
        assert_eq!(bundle.signed_pre_key.id, 1);
        assert_eq!(bundle.pre_key.as_ref().unwrap().id, 7);
        assert!(keys::verify_signature(
            &bundle.identity_key,
            &bundle.signed_pre_key.public_key,
            &bundle.signed_pre_key.signature,
        ));
    }

    #[test]
    fn test_registration_id_is_14_bit() {
        for _ in 0..32 {
            let registration_id = generate_registration_id();
            assert!(registration_id > 0);
            assert!(registration_id <= 0x3fff);
        }
    }
}
