use crate::error::{Error, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use ring::digest;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES-256-CBC encryption with PKCS#7 padding
pub fn aes256_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidArgument("AES key must be 32 bytes, IV 16 bytes".to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

/// AES-256-CBC decryption with PKCS#7 padding
pub fn aes256_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidArgument("AES key must be 32 bytes, IV 16 bytes".to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| Error::Decrypt("Invalid padding".to_string()))
}

/// HMAC-SHA-256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::InvalidArgument("Invalid HMAC key".to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// SHA-512 hash
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(digest::digest(&digest::SHA512, data).as_ref());
    out
}

/// HKDF-SHA-256 bounded to at most three 32-byte output blocks.
///
/// The salt is required to be exactly 32 bytes, matching the zero-salt
/// convention of the key schedule.
pub fn hkdf(input: &[u8], salt: &[u8], info: &[u8], chunks: usize) -> Result<Vec<[u8; 32]>> {
    if salt.len() != 32 {
        return Err(Error::InvalidArgument("HKDF salt must be 32 bytes".to_string()));
    }
    if !(1..=3).contains(&chunks) {
        return Err(Error::InvalidArgument(format!(
            "HKDF chunks must be between 1 and 3, got {}",
            chunks
        )));
    }

    let hk = Hkdf::<Sha256>::new(Some(salt), input);
    let mut okm = [0u8; 96];
    hk.expand(info, &mut okm[..32 * chunks])
        .map_err(|e| Error::InvalidArgument(format!("HKDF expansion failed: {}", e)))?;

    Ok(okm[..32 * chunks]
        .chunks_exact(32)
        .map(|c| {
            let mut block = [0u8; 32];
            block.copy_from_slice(c);
            block
        })
        .collect())
}

/// Constant-time comparison, required for all MAC checks
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Generate random bytes
pub fn random_bytes(length: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbc_roundtrip() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let plaintext = b"attack at dawn";

        let ciphertext = aes256_cbc_encrypt(&key, &iv, plaintext).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(ciphertext.len() % 16, 0);

        let decrypted = aes256_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_cbc_bad_padding() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let garbage = [0u8; 32];

        let result = aes256_cbc_decrypt(&key, &iv, &garbage);
        assert!(matches!(result, Err(Error::Decrypt(_))));
    }

    #[test]
    fn test_cbc_rejects_short_key() {
        let result = aes256_cbc_encrypt(&[1u8; 16], &[0u8; 16], b"data");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        // RFC 4231 test case 2
        let key = b"Jefe";
        let data = b"what do ya want for nothing?";
        let mac = hmac_sha256(key, data).unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sha512_abc() {
        let digest = sha512(b"abc");
        assert_eq!(
            hex::encode(&digest[..16]),
            "ddaf35a193617abacc417349ae204131"
        );
    }

    #[test]
    fn test_hkdf_rejects_bad_salt() {
        let result = hkdf(b"input", &[0u8; 16], b"info", 2);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_hkdf_rejects_chunk_range() {
        assert!(hkdf(b"input", &[0u8; 32], b"info", 0).is_err());
        assert!(hkdf(b"input", &[0u8; 32], b"info", 4).is_err());
    }

    #[test]
    fn test_hkdf_rfc5869_case1() {
        // RFC 5869 test case 1, first two output blocks
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0u8..13).collect();
        let mut salt32 = vec![0u8; 32];
        salt32[..13].copy_from_slice(&salt);

        // The RFC uses a 13-byte salt; with a 32-byte zero-extended salt the
        // output differs, so just pin the derivation shape and determinism.
        let a = hkdf(&ikm, &salt32, &[0xf0, 0xf1, 0xf2], 3).unwrap();
        let b = hkdf(&ikm, &salt32, &[0xf0, 0xf1, 0xf2], 3).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn test_hkdf_zero_salt_matches_hmac_expand() {
        // One-block HKDF with all-zero salt must equal
        // HMAC(HMAC(0^32, input), info || 0x01).
        let input = [3u8; 32];
        let info = b"WhisperText";

        let prk = hmac_sha256(&[0u8; 32], &input).unwrap();
        let mut block_input = info.to_vec();
        block_input.push(0x01);
        let expected = hmac_sha256(&prk, &block_input).unwrap();

        let derived = hkdf(&input, &[0u8; 32], info, 1).unwrap();
        assert_eq!(derived[0], expected);
    }

    #[test]
    fn test_constant_time_equal() {
        assert!(constant_time_equal(b"12345678", b"12345678"));
        assert!(!constant_time_equal(b"12345678", b"12345679"));
        assert!(!constant_time_equal(b"1234", b"12345678"));
    }

    #[test]
    fn test_random_bytes() {
        let a = random_bytes(32);
        let b = random_bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
