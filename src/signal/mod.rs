//! Client-side Signal protocol: X3DH initial key agreement followed by the
//! Double Ratchet, with per-address serialization of all session mutation.

pub mod builder;
pub mod cipher;
pub mod prekey;
pub mod ratchet;
pub mod record;

pub use builder::SessionBuilder;
pub use cipher::{EncryptedMessage, SessionCipher};
pub use prekey::{
    generate_identity_key_pair, generate_registration_id, PreKey, PreKeyBundle, PublicPreKey,
    SignedPreKey, SignedPublicPreKey,
};
pub use ratchet::{BaseKeyType, Chain, ChainKey, ChainType, SessionState};
pub use record::SessionRecord;

/// Wire message kinds produced by [`SessionCipher::encrypt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Whisper = 1,
    PreKey = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Whisper as u8, 1);
        assert_eq!(MessageType::PreKey as u8, 3);
    }
}
