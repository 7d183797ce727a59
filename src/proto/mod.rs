//! Wire message definitions.
//!
//! Field numbers are part of the deployed wire format and must not change.

use crate::error::{Error, Result};

/// Protocol version carried in the leading byte of every frame
pub const VERSION: u8 = 3;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WhisperMessage {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub ephemeral_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    pub counter: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub previous_counter: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub ciphertext: Option<Vec<u8>>,
}

// Fields are declared in ascending tag order; prost emits fields in
// declaration order, so this keeps frames byte-identical across builds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeyWhisperMessage {
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub base_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub identity_key: Option<Vec<u8>>,
    /// Full inner WhisperMessage frame, version byte and MAC included
    #[prost(bytes = "vec", optional, tag = "4")]
    pub message: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    pub registration_id: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub signed_pre_key_id: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyExchangeMessage {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub base_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub ephemeral_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub identity_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub base_key_signature: Option<Vec<u8>>,
}

/// The version byte: current version in the high nibble, minimum
/// compatible version in the low nibble.
pub fn version_byte() -> u8 {
    (VERSION << 4) | VERSION
}

/// Split a version byte into `(sender_version, minimum_version)`
pub fn decode_tuple_byte(byte: u8) -> (u8, u8) {
    (byte >> 4, byte & 0x0f)
}

/// Gate on the version byte before any cryptographic work
pub fn check_version_byte(byte: u8) -> Result<()> {
    let (sender, minimum) = decode_tuple_byte(byte);
    if minimum > VERSION || sender < VERSION {
        return Err(Error::Session(format!(
            "Incompatible version byte: {:#04x}",
            byte
        )));
    }
    Ok(())
}
