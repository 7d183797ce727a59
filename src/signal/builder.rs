//! Initial session construction.
//!
//! The sender derives a session from a published prekey bundle; the
//! receiver mirrors it from the first incoming PreKey message. Both sides
//! arrive at the same root via the X3DH agreement quadruple.

use crate::error::{Error, Result};
use crate::proto::PreKeyWhisperMessage;
use crate::queue::queue_job;
use crate::signal::prekey::PreKeyBundle;
use crate::signal::ratchet::{
    BaseKeyType, Chain, ChainType, CurrentRatchet, IndexInfo, PendingPreKey, SessionState,
};
use crate::signal::record::{now_ms, SessionRecord};
use crate::store::ProtocolStore;
use crate::types::ProtocolAddress;
use crate::util::{crypto, keys, keys::KeyPair};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

/// X3DH discontinuity prefix
const DISCONTINUITY: [u8; 32] = [0xff; 32];

pub struct SessionBuilder {
    storage: Arc<dyn ProtocolStore>,
    address: ProtocolAddress,
}

impl SessionBuilder {
    pub fn new(storage: Arc<dyn ProtocolStore>, address: ProtocolAddress) -> Self {
        Self { storage, address }
    }

    /// Establish an outbound session from the peer's prekey bundle.
    ///
    /// Replaces any currently open session for the address; the replaced
    /// session is retained closed.
    pub async fn init_outgoing(&self, bundle: &PreKeyBundle) -> Result<()> {
        queue_job(&self.address.to_string(), self.process_bundle(bundle)).await
    }

    async fn process_bundle(&self, bundle: &PreKeyBundle) -> Result<()> {
        if !keys::verify_signature(
            &bundle.identity_key,
            &bundle.signed_pre_key.public_key,
            &bundle.signed_pre_key.signature,
        ) {
            return Err(Error::InvalidSignature(
                "Prekey bundle signature does not verify".to_string(),
            ));
        }
        if !self
            .storage
            .is_trusted_identity(&self.address.id, &bundle.identity_key)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                address: self.address.id.clone(),
                identity_key: bundle.identity_key.clone(),
            });
        }

        let our_identity = self.storage.get_our_identity().await?;
        let base_key = KeyPair::generate();

        let agreement_a =
            keys::calculate_agreement(&bundle.signed_pre_key.public_key, &our_identity.private_key)?;
        let agreement_b =
            keys::calculate_agreement(&bundle.identity_key, &base_key.private_key)?;
        let agreement_c =
            keys::calculate_agreement(&bundle.signed_pre_key.public_key, &base_key.private_key)?;

        let mut master_secret = Zeroizing::new(Vec::with_capacity(32 * 5));
        master_secret.extend_from_slice(&DISCONTINUITY);
        master_secret.extend_from_slice(&agreement_a);
        master_secret.extend_from_slice(&agreement_b);
        master_secret.extend_from_slice(&agreement_c);
        if let Some(pre_key) = &bundle.pre_key {
            let agreement_d =
                keys::calculate_agreement(&pre_key.public_key, &base_key.private_key)?;
            master_secret.extend_from_slice(&agreement_d);
        }

        let derived = crypto::hkdf(&master_secret, &[0u8; 32], b"WhisperText", 2)?;

        let now = now_ms();
        let mut session = SessionState {
            registration_id: Some(bundle.registration_id),
            current_ratchet: CurrentRatchet {
                root_key: derived[0].to_vec(),
                // The base key doubles as our first ratchet key
                ephemeral_key_pair: base_key.clone(),
                last_remote_ephemeral_key: bundle.signed_pre_key.public_key.clone(),
                previous_counter: 0,
            },
            index_info: IndexInfo {
                base_key: base_key.public_key.clone(),
                base_key_type: BaseKeyType::Ours,
                closed: -1,
                used: now,
                created: now,
                remote_identity_key: bundle.identity_key.clone(),
            },
            pending_pre_key: Some(PendingPreKey {
                signed_key_id: bundle.signed_pre_key.id,
                pre_key_id: bundle.pre_key.as_ref().map(|pre_key| pre_key.id),
                base_key: base_key.public_key.clone(),
            }),
            chains: HashMap::new(),
        };
        session.add_chain(
            &base_key.public_key,
            Chain::new(ChainType::Sending, derived[1].to_vec()),
        );

        let mut record = self
            .storage
            .load_session(&self.address)
            .await?
            .unwrap_or_default();
        record.archive_current_state();
        record.set_session(session);
        self.storage.store_session(&self.address, &record).await?;

        tracing::info!(address = %self.address, "outbound session established");
        Ok(())
    }

    /// Mirror a session from an incoming PreKey message.
    ///
    /// Returns the one-time prekey id the message consumed, so the caller
    /// can remove it after the record is persisted. Must run under the
    /// address job queue; the cipher is the entry point.
    pub(crate) async fn init_incoming(
        &self,
        record: &mut SessionRecord,
        message: &PreKeyWhisperMessage,
    ) -> Result<Option<u32>> {
        let their_identity = message
            .identity_key
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("PreKey message has no identity key".to_string()))?;
        let their_base_key = message
            .base_key
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("PreKey message has no base key".to_string()))?;

        if !self
            .storage
            .is_trusted_identity(&self.address.id, their_identity)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                address: self.address.id.clone(),
                identity_key: their_identity.clone(),
            });
        }

        // A replayed PreKey message for a known session decrypts against the
        // existing state; nothing to build.
        if record.session(their_base_key)?.is_some() {
            tracing::debug!(address = %self.address, "session already known for base key");
            return Ok(None);
        }

        let signed_pre_key_id = message.signed_pre_key_id.ok_or_else(|| {
            Error::InvalidArgument("PreKey message has no signed prekey id".to_string())
        })?;
        let our_signed_pre_key = self
            .storage
            .load_signed_pre_key(signed_pre_key_id)
            .await?
            .ok_or_else(|| {
                Error::InvalidKeyId(format!("Missing signed prekey {}", signed_pre_key_id))
            })?;

        let our_pre_key = match message.pre_key_id {
            Some(pre_key_id) => Some(
                self.storage
                    .load_pre_key(pre_key_id)
                    .await?
                    .ok_or_else(|| Error::PreKey(format!("Invalid prekey id {}", pre_key_id)))?,
            ),
            None => None,
        };

        let our_identity = self.storage.get_our_identity().await?;

        let agreement_a =
            keys::calculate_agreement(their_identity, &our_signed_pre_key.key_pair.private_key)?;
        let agreement_b =
            keys::calculate_agreement(their_base_key, &our_identity.private_key)?;
        let agreement_c =
            keys::calculate_agreement(their_base_key, &our_signed_pre_key.key_pair.private_key)?;

        let mut master_secret = Zeroizing::new(Vec::with_capacity(32 * 5));
        master_secret.extend_from_slice(&DISCONTINUITY);
        master_secret.extend_from_slice(&agreement_a);
        master_secret.extend_from_slice(&agreement_b);
        master_secret.extend_from_slice(&agreement_c);
        if let Some(pre_key) = &our_pre_key {
            let agreement_d =
                keys::calculate_agreement(their_base_key, &pre_key.key_pair.private_key)?;
            master_secret.extend_from_slice(&agreement_d);
        }

        let derived = crypto::hkdf(&master_secret, &[0u8; 32], b"WhisperText", 2)?;

        let now = now_ms();
        let mut session = SessionState {
            registration_id: message.registration_id,
            current_ratchet: CurrentRatchet {
                root_key: derived[0].to_vec(),
                ephemeral_key_pair: KeyPair::generate(),
                last_remote_ephemeral_key: their_base_key.clone(),
                previous_counter: 0,
            },
            index_info: IndexInfo {
                base_key: their_base_key.clone(),
                base_key_type: BaseKeyType::Theirs,
                closed: -1,
                used: now,
                created: now,
                remote_identity_key: their_identity.clone(),
            },
            pending_pre_key: None,
            chains: HashMap::new(),
        };
        // The sender's base key heads their first sending chain; file the
        // X3DH chain under it for receiving, then ratchet once to stand up
        // our own sending chain.
        session.add_chain(
            their_base_key,
            Chain::new(ChainType::Receiving, derived[1].to_vec()),
        );
        session.calculate_ratchet(their_base_key, true)?;

        if record.have_open_session() {
            record.archive_current_state();
        }
        record.set_session(session);

        tracing::info!(address = %self.address, "inbound session established");
        Ok(message.pre_key_id)
    }
}
