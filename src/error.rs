use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session error: {0}")]
    Session(String),

    #[error("No matching sessions found for message")]
    NoMatchingSessions(#[source] Box<Error>),

    #[error("Untrusted identity key for {address}")]
    UntrustedIdentity {
        address: String,
        identity_key: Vec<u8>,
    },

    #[error("Message counter error: {0}")]
    MessageCounter(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid key id: {0}")]
    InvalidKeyId(String),

    #[error("Bad MAC")]
    Mac,

    #[error("Decryption error: {0}")]
    Decrypt(String),

    #[error("PreKey error: {0}")]
    PreKey(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
