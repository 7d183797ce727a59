// Copyright (c) 2025 whisper-protocol Contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # whisper-protocol
//!
//! A Rust client library for the Signal end-to-end encryption protocol:
//! X3DH initial key agreement from prekey bundles, Double Ratchet message
//! encryption with forward secrecy, and the session record machinery to
//! hold it all, behind a pluggable async storage interface.
//!
//! Encryption and decryption go through [`SessionCipher`]; sessions are
//! established with [`SessionBuilder`] from a [`PreKeyBundle`] (sender) or
//! implicitly from an incoming PreKey message (receiver).

pub mod error;
pub mod proto;
pub mod queue;
pub mod signal;
pub mod store;
pub mod types;
pub mod util;

pub use error::{Error, Result};
pub use signal::{
    generate_identity_key_pair, generate_registration_id, EncryptedMessage, MessageType, PreKey,
    PreKeyBundle, SessionBuilder, SessionCipher, SessionRecord, SignedPreKey,
};
pub use store::{MemoryStore, ProtocolStore};
pub use types::ProtocolAddress;
pub use util::keys::KeyPair;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
