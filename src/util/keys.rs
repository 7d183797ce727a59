use crate::error::{Error, Result};
use curve25519_dalek::{edwards::EdwardsPoint, montgomery::MontgomeryPoint, scalar::Scalar};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key type prefix for curve25519 public keys in their wire form
pub const DJB_TYPE: u8 = 0x05;

/// Elliptic curve key pair for X25519.
///
/// The public component is carried in its 33-byte type-prefixed form
/// (`0x05 || x-coordinate`) everywhere it touches the wire or a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    #[serde(with = "crate::util::serde_b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::util::serde_b64::fixed32")]
    pub private_key: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut private_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_key);
        Self::derive(clamp(private_key))
    }

    /// Create from private key bytes, applying X25519 clamping
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::InvalidArgument(
                "Private key must be 32 bytes".to_string(),
            ));
        }

        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(bytes);
        Ok(Self::derive(clamp(private_key)))
    }

    fn derive(private_key: [u8; 32]) -> Self {
        let raw_public = x25519(private_key, X25519_BASEPOINT_BYTES);
        let mut public_key = Vec::with_capacity(33);
        public_key.push(DJB_TYPE);
        public_key.extend_from_slice(&raw_public);

        Self {
            public_key,
            private_key,
        }
    }
}

fn clamp(mut key: [u8; 32]) -> [u8; 32] {
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    key
}

/// Strip the type prefix from a wire-form public key.
///
/// Accepts both the 33-byte prefixed form and a bare 32-byte x-coordinate.
fn scrub_public_key(public_key: &[u8]) -> Result<[u8; 32]> {
    let raw = match public_key.len() {
        33 if public_key[0] == DJB_TYPE => &public_key[1..],
        32 => public_key,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "Invalid public key ({} bytes)",
                public_key.len()
            )))
        }
    };

    let mut out = [0u8; 32];
    out.copy_from_slice(raw);
    Ok(out)
}

/// X25519 agreement between their wire-form public key and our private key
pub fn calculate_agreement(their_public: &[u8], our_private: &[u8; 32]) -> Result<[u8; 32]> {
    let raw_public = scrub_public_key(their_public)?;
    Ok(x25519(*our_private, raw_public))
}

/// Sign a message with a curve25519 private key.
///
/// The signature has Ed25519 shape: `R || s`, with the sign bit of the
/// corresponding Edwards public key folded into the top bit of `s`.
pub fn calculate_signature(private_key: &[u8; 32], message: &[u8]) -> Result<[u8; 64]> {
    let private_key = clamp(*private_key);
    let scalar = Scalar::from_bytes_mod_order(private_key);
    let ed_public = EdwardsPoint::mul_base(&scalar).compress();
    let sign_bit = ed_public.as_bytes()[31] & 0x80;

    let mut random = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut random);

    let mut hash = Sha512::new();
    hash.update([0xfeu8]);
    hash.update([0xffu8; 31]);
    hash.update(private_key);
    hash.update(message);
    hash.update(random);
    let digest: [u8; 64] = hash.finalize().into();
    let r = Scalar::from_bytes_mod_order_wide(&digest);

    let commitment = EdwardsPoint::mul_base(&r).compress();

    let mut hash = Sha512::new();
    hash.update(commitment.as_bytes());
    hash.update(ed_public.as_bytes());
    hash.update(message);
    let digest: [u8; 64] = hash.finalize().into();
    let challenge = Scalar::from_bytes_mod_order_wide(&digest);

    let s = r + challenge * scalar;

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(commitment.as_bytes());
    signature[32..].copy_from_slice(&s.to_bytes());
    signature[63] |= sign_bit;
    Ok(signature)
}

/// Verify an Ed25519-shape signature over a curve25519 public key.
///
/// Fails closed: any malformed input verifies as false.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let raw_public = match scrub_public_key(public_key) {
        Ok(raw) => raw,
        Err(_) => return false,
    };
    if signature.len() != 64 {
        return false;
    }

    let sign_bit = (signature[63] & 0x80) >> 7;
    let ed_public = match MontgomeryPoint(raw_public).to_edwards(sign_bit) {
        Some(point) => point,
        None => return false,
    };
    let verifying_key = match VerifyingKey::from_bytes(&ed_public.compress().to_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(signature);
    sig_bytes[63] &= 0x7f;

    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}
