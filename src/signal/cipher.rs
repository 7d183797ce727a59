//! Encrypt/decrypt orchestration for one remote address.
//!
//! Every public method runs as a job on the per-address queue, so session
//! mutation has a single writer. Decryption works on a clone of the
//! candidate session and publishes it into the record only after the MAC
//! and padding checks pass; a failed attempt leaves storage untouched.

use crate::error::{Error, Result};
use crate::proto::{self, PreKeyWhisperMessage, WhisperMessage};
use crate::queue::queue_job;
use crate::signal::builder::SessionBuilder;
use crate::signal::ratchet::{ChainType, MessageKeys, SessionState};
use crate::signal::record::{now_ms, SessionRecord};
use crate::signal::MessageType;
use crate::store::ProtocolStore;
use crate::types::ProtocolAddress;
use crate::util::{crypto, keys::KeyPair};
use prost::Message;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Truncated MAC appended to every WhisperMessage frame
const MAC_LENGTH: usize = 8;

/// Result of [`SessionCipher::encrypt`]: the framed body plus the peer's
/// registration id as recorded in the session.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    pub message_type: MessageType,
    pub body: Vec<u8>,
    pub registration_id: Option<u32>,
}

pub struct SessionCipher {
    storage: Arc<dyn ProtocolStore>,
    address: ProtocolAddress,
}

impl SessionCipher {
    pub fn new(storage: Arc<dyn ProtocolStore>, address: ProtocolAddress) -> Self {
        Self { storage, address }
    }

    /// Encrypt one message on the open session.
    ///
    /// While the session still carries its pending prekey, the frame is
    /// wrapped as a PreKey message so the peer can bootstrap.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        queue_job(&self.address.to_string(), self.encrypt_job(plaintext)).await
    }

    /// Decrypt a bare WhisperMessage frame, trying sessions most recently
    /// used first.
    pub async fn decrypt_whisper_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        queue_job(&self.address.to_string(), self.decrypt_whisper_job(data)).await
    }

    /// Decrypt a PreKeyWhisperMessage frame, building the session first if
    /// this base key is new.
    pub async fn decrypt_pre_key_whisper_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        queue_job(&self.address.to_string(), self.decrypt_pre_key_job(data)).await
    }

    pub async fn has_open_session(&self) -> Result<bool> {
        queue_job(&self.address.to_string(), async {
            Ok(self
                .storage
                .load_session(&self.address)
                .await?
                .map(|record| record.have_open_session())
                .unwrap_or(false))
        })
        .await
    }

    /// Close the open session, retaining it for late messages
    pub async fn close_open_session(&self) -> Result<()> {
        queue_job(&self.address.to_string(), async {
            if let Some(mut record) = self.storage.load_session(&self.address).await? {
                record.archive_current_state();
                self.storage.store_session(&self.address, &record).await?;
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_all_sessions(&self) -> Result<()> {
        queue_job(&self.address.to_string(), async {
            if let Some(mut record) = self.storage.load_session(&self.address).await? {
                record.delete_all_sessions();
                self.storage.store_session(&self.address, &record).await?;
            }
            Ok(())
        })
        .await
    }

    async fn encrypt_job(&self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let our_identity = self.storage.get_our_identity().await?;
        let our_registration_id = self.storage.get_our_registration_id().await?;
        let mut record = self
            .storage
            .load_session(&self.address)
            .await?
            .ok_or_else(|| Error::Session("No sessions".to_string()))?;

        let remote_identity = record
            .open_session()
            .ok_or_else(|| Error::Session("No sessions".to_string()))?
            .index_info
            .remote_identity_key
            .clone();
        if !self
            .storage
            .is_trusted_identity(&self.address.id, &remote_identity)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                address: self.address.id.clone(),
                identity_key: remote_identity,
            });
        }

        let message = {
            let session = record
                .open_session_mut()
                .ok_or_else(|| Error::Session("No sessions".to_string()))?;
            Self::encrypt_on_session(session, plaintext, &our_identity, our_registration_id)?
        };

        self.storage.store_session(&self.address, &record).await?;
        Ok(message)
    }

    fn encrypt_on_session(
        session: &mut SessionState,
        plaintext: &[u8],
        our_identity: &KeyPair,
        our_registration_id: u32,
    ) -> Result<EncryptedMessage> {
        let our_ephemeral_key = session.current_ratchet.ephemeral_key_pair.public_key.clone();
        let previous_counter = session.current_ratchet.previous_counter;
        let remote_identity = session.index_info.remote_identity_key.clone();

        let chain = session
            .sending_chain_mut()
            .ok_or_else(|| Error::Session("No sending chain for current ratchet key".to_string()))?;
        if chain.chain_type == ChainType::Receiving {
            return Err(Error::Session(
                "Tried to encrypt on a receiving chain".to_string(),
            ));
        }

        let counter = (chain.chain_key.counter + 1) as u32;
        chain.fill_message_keys(counter)?;
        let seed = Zeroizing::new(chain.message_keys.remove(&counter).ok_or_else(|| {
            Error::MessageCounter("Key used already or never filled".to_string())
        })?);
        let message_keys = MessageKeys::derive(&seed)?;

        let ciphertext =
            crypto::aes256_cbc_encrypt(&message_keys.cipher_key, &message_keys.iv, plaintext)?;

        let encoded = WhisperMessage {
            ephemeral_key: Some(our_ephemeral_key),
            counter: Some(counter),
            previous_counter: Some(previous_counter),
            ciphertext: Some(ciphertext),
        }
        .encode_to_vec();

        let version = proto::version_byte();
        let mut mac_input = Vec::with_capacity(33 * 2 + 1 + encoded.len());
        mac_input.extend_from_slice(&our_identity.public_key);
        mac_input.extend_from_slice(&remote_identity);
        mac_input.push(version);
        mac_input.extend_from_slice(&encoded);
        let mac = crypto::hmac_sha256(&message_keys.mac_key, &mac_input)?;

        let mut frame = Vec::with_capacity(1 + encoded.len() + MAC_LENGTH);
        frame.push(version);
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&mac[..MAC_LENGTH]);

        tracing::debug!(counter, "encrypted message");

        if let Some(pending) = &session.pending_pre_key {
            let wrapped = PreKeyWhisperMessage {
                pre_key_id: pending.pre_key_id,
                base_key: Some(pending.base_key.clone()),
                identity_key: Some(our_identity.public_key.clone()),
                message: Some(frame),
                registration_id: Some(our_registration_id),
                signed_pre_key_id: Some(pending.signed_key_id),
            }
            .encode_to_vec();

            let mut body = Vec::with_capacity(1 + wrapped.len());
            body.push(version);
            body.extend_from_slice(&wrapped);
            Ok(EncryptedMessage {
                message_type: MessageType::PreKey,
                body,
                registration_id: session.registration_id,
            })
        } else {
            Ok(EncryptedMessage {
                message_type: MessageType::Whisper,
                body: frame,
                registration_id: session.registration_id,
            })
        }
    }

    async fn decrypt_whisper_job(&self, data: &[u8]) -> Result<Vec<u8>> {
        let our_identity = self.storage.get_our_identity().await?;
        let mut record = self
            .storage
            .load_session(&self.address)
            .await?
            .ok_or_else(|| Error::Session("No session record".to_string()))?;

        // Trial decryption over clones, most recently used first; the
        // record only learns about the winner.
        let candidates: Vec<SessionState> =
            record.sessions().into_iter().cloned().collect();
        let mut first_error = None;
        let mut winner = None;
        for mut session in candidates {
            match Self::do_decrypt(&mut session, data, &our_identity) {
                Ok(plaintext) => {
                    winner = Some((session, plaintext));
                    break;
                }
                Err(error) => {
                    tracing::debug!(%error, "session failed trial decryption");
                    first_error.get_or_insert(error);
                }
            }
        }

        let (mut session, plaintext) = winner.ok_or_else(|| {
            Error::NoMatchingSessions(Box::new(first_error.unwrap_or_else(|| {
                Error::Session("No sessions available".to_string())
            })))
        })?;

        if !self
            .storage
            .is_trusted_identity(&self.address.id, &session.index_info.remote_identity_key)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                address: self.address.id.clone(),
                identity_key: session.index_info.remote_identity_key,
            });
        }

        if session.index_info.closed != -1 {
            tracing::warn!(address = %self.address, "decrypted message with closed session");
        }
        session.index_info.used = now_ms();
        record.set_session(session);
        self.storage.store_session(&self.address, &record).await?;
        Ok(plaintext)
    }

    async fn decrypt_pre_key_job(&self, data: &[u8]) -> Result<Vec<u8>> {
        let version = *data
            .first()
            .ok_or_else(|| Error::InvalidArgument("Empty PreKey message".to_string()))?;
        proto::check_version_byte(version)?;
        let message = PreKeyWhisperMessage::decode(&data[1..])?;

        let mut record = match self.storage.load_session(&self.address).await? {
            Some(record) => record,
            None => {
                if message.registration_id.is_none() {
                    return Err(Error::Session(
                        "No registration id on first PreKey message".to_string(),
                    ));
                }
                SessionRecord::new()
            }
        };

        let builder = SessionBuilder::new(self.storage.clone(), self.address.clone());
        let consumed_pre_key_id = builder.init_incoming(&mut record, &message).await?;

        let base_key = message
            .base_key
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("PreKey message has no base key".to_string()))?;
        let frame = message
            .message
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("PreKey message has no payload".to_string()))?;

        let our_identity = self.storage.get_our_identity().await?;
        let mut session = record
            .session(base_key)?
            .cloned()
            .ok_or_else(|| Error::Session("Missing session for base key".to_string()))?;

        let plaintext = Self::do_decrypt(&mut session, frame, &our_identity)?;

        record.set_session(session);
        self.storage.store_session(&self.address, &record).await?;
        if let Some(pre_key_id) = consumed_pre_key_id {
            self.storage.remove_pre_key(pre_key_id).await?;
        }
        Ok(plaintext)
    }

    /// Decrypt one inner WhisperMessage frame against `session`.
    ///
    /// Mutates only the given state; the caller decides whether the
    /// mutation is published.
    fn do_decrypt(
        session: &mut SessionState,
        data: &[u8],
        our_identity: &KeyPair,
    ) -> Result<Vec<u8>> {
        if data.len() <= 1 + MAC_LENGTH {
            return Err(Error::InvalidArgument("Message too short".to_string()));
        }
        let version = data[0];
        proto::check_version_byte(version)?;

        let encoded = &data[1..data.len() - MAC_LENGTH];
        let their_mac = &data[data.len() - MAC_LENGTH..];
        let message = WhisperMessage::decode(encoded)?;

        let ephemeral_key = message
            .ephemeral_key
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("Message has no ephemeral key".to_string()))?;
        let counter = message
            .counter
            .ok_or_else(|| Error::InvalidArgument("Message has no counter".to_string()))?;
        let ciphertext = message
            .ciphertext
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("Message has no ciphertext".to_string()))?;

        session.maybe_step_ratchet(ephemeral_key, message.previous_counter.unwrap_or(0))?;

        let chain = session
            .chain_mut(ephemeral_key)
            .ok_or_else(|| Error::Session("No chain for ephemeral key".to_string()))?;
        if chain.chain_type == ChainType::Sending {
            return Err(Error::Session(
                "Tried to decrypt on a sending chain".to_string(),
            ));
        }

        chain.fill_message_keys(counter)?;
        let seed = Zeroizing::new(chain.message_keys.remove(&counter).ok_or_else(|| {
            Error::MessageCounter("Key used already or never filled".to_string())
        })?);
        let message_keys = MessageKeys::derive(&seed)?;

        let mut mac_input = Vec::with_capacity(33 * 2 + 1 + encoded.len());
        mac_input.extend_from_slice(&session.index_info.remote_identity_key);
        mac_input.extend_from_slice(&our_identity.public_key);
        mac_input.push(version);
        mac_input.extend_from_slice(&encoded);
        let our_mac = crypto::hmac_sha256(&message_keys.mac_key, &mac_input)?;
        if !crypto::constant_time_equal(&our_mac[..MAC_LENGTH], their_mac) {
            return Err(Error::Mac);
        }

        let plaintext =
            crypto::aes256_cbc_decrypt(&message_keys.cipher_key, &message_keys.iv, ciphertext)?;

        // The peer has our reply path now; stop echoing the prekey block
        session.pending_pre_key = None;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cipher_for(address: &str) -> SessionCipher {
        SessionCipher::new(
            Arc::new(MemoryStore::generate()),
            ProtocolAddress::new(address, 1).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_encrypt_without_session_fails() {
        let cipher = cipher_for("nobody");
        let result = cipher.encrypt(b"hello").await;
        assert!(matches!(result, Err(Error::Session(_))));
    }

    #[tokio::test]
    async fn test_decrypt_without_record_fails() {
        let cipher = cipher_for("nobody");
        let result = cipher.decrypt_whisper_message(&[0x33, 0, 0]).await;
        assert!(matches!(result, Err(Error::Session(_))));
    }

    #[tokio::test]
    async fn test_pre_key_decrypt_gates_on_version() {
        let cipher = cipher_for("nobody");
        for bad in [0x22u8, 0x44, 0x00] {
            let result = cipher.decrypt_pre_key_whisper_message(&[bad, 1, 2, 3]).await;
            assert!(matches!(result, Err(Error::Session(_))), "byte {bad:#x}");
        }
    }

    #[tokio::test]
    async fn test_has_open_session_empty() {
        let cipher = cipher_for("nobody");
        assert!(!cipher.has_open_session().await.unwrap());
        // Closing or deleting with no record is a no-op
        cipher.close_open_session().await.unwrap();
        cipher.delete_all_sessions().await.unwrap();
    }
}
