//! Session cookie codec.
//!
//! A fresh client cookie is, before base64:
//!
//! ```text
//! seed[16] || CTR( magic:u32le || pad_len:u16le || padding || client_pub[32] || sealed )
//! ```
//!
//! The CTR keystream is derived from the seed and the shared obfuscation
//! secret, so the whole value is indistinguishable from random bytes. The
//! sealed portion is an XChaCha20-Poly1305 box keyed from an X25519 exchange
//! between the client's ephemeral key and the server's configured key, opened
//! with an all-zeros nonce. The zero nonce is safe because every cookie uses
//! a fresh ephemeral client key.

use aes::Aes256;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use cloakway_common::helpers::rng::get_crypto_rng;
use ctr::cipher::{KeyIvInit, StreamCipher};
use data_encoding::BASE64;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::MeekError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const OBFUSCATION_SEED_LEN: usize = 16;
const OBFUSCATION_MAGIC: u32 = 0x9c6b_4de1;
const OBFUSCATION_MAX_PADDING: usize = 32;
const OBFUSCATION_HEADER_LEN: usize = 6;
const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookiePayload {
    #[serde(rename = "v")]
    pub version: i32,
    #[serde(rename = "s", default)]
    pub session_token: String,
    #[serde(rename = "p", default)]
    pub peer_address: String,
}

pub fn parse_private_key(base64_key: &str) -> Result<StaticSecret, MeekError> {
    let bytes = BASE64
        .decode(base64_key.as_bytes())
        .map_err(|_| MeekError::InvalidPrivateKey)?;
    let bytes: [u8; PUBLIC_KEY_LEN] =
        bytes.try_into().map_err(|_| MeekError::InvalidPrivateKey)?;
    Ok(StaticSecret::from(bytes))
}

/// Decodes and opens a freshly issued client cookie.
pub fn decode_cookie(
    obfuscated_key: &str,
    private_key: &StaticSecret,
    cookie_value: &str,
) -> Result<CookiePayload, MeekError> {
    let raw = BASE64
        .decode(cookie_value.as_bytes())
        .map_err(|_| MeekError::BadCookie("invalid base64"))?;

    if raw.len() < OBFUSCATION_SEED_LEN + OBFUSCATION_HEADER_LEN {
        return Err(MeekError::BadCookie("truncated obfuscation prefix"));
    }

    let (seed, rest) = raw.split_at(OBFUSCATION_SEED_LEN);
    let mut plaintext = rest.to_vec();
    obfuscation_cipher(obfuscated_key, seed).apply_keystream(&mut plaintext);

    let magic = u32::from_le_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
    if magic != OBFUSCATION_MAGIC {
        return Err(MeekError::BadCookie("obfuscation magic mismatch"));
    }
    let pad_len = u16::from_le_bytes([plaintext[4], plaintext[5]]) as usize;
    if pad_len > OBFUSCATION_MAX_PADDING
        || plaintext.len() < OBFUSCATION_HEADER_LEN + pad_len + PUBLIC_KEY_LEN
    {
        return Err(MeekError::BadCookie("truncated payload"));
    }

    let payload = &plaintext[OBFUSCATION_HEADER_LEN + pad_len..];
    let mut client_public = [0u8; PUBLIC_KEY_LEN];
    client_public.copy_from_slice(&payload[..PUBLIC_KEY_LEN]);
    let sealed = &payload[PUBLIC_KEY_LEN..];

    let opened = sealed_box_cipher(private_key, &PublicKey::from(client_public))
        .decrypt(&zero_nonce(), sealed)
        .map_err(|_| MeekError::BadCookie("sealed payload does not open"))?;

    serde_json::from_slice(&opened).map_err(|_| MeekError::BadCookie("malformed payload json"))
}

/// Client-side counterpart of [`decode_cookie`]; exact inverse of the decode
/// path. Used by client tooling and tests.
pub fn seal_cookie(
    obfuscated_key: &str,
    server_public: &PublicKey,
    payload: &CookiePayload,
) -> Result<String, MeekError> {
    let mut rng = get_crypto_rng();

    let ephemeral = StaticSecret::random_from_rng(&mut rng);
    let json = serde_json::to_vec(payload).map_err(|_| MeekError::BadCookie("payload json"))?;
    let sealed = sealed_box_cipher(&ephemeral, server_public)
        .encrypt(&zero_nonce(), json.as_slice())
        .map_err(|_| MeekError::BadCookie("sealing failed"))?;

    let pad_len = rng.gen_range(0..=OBFUSCATION_MAX_PADDING);
    let mut plaintext =
        Vec::with_capacity(OBFUSCATION_HEADER_LEN + pad_len + PUBLIC_KEY_LEN + sealed.len());
    plaintext.extend_from_slice(&OBFUSCATION_MAGIC.to_le_bytes());
    plaintext.extend_from_slice(&(pad_len as u16).to_le_bytes());
    let mut padding = vec![0u8; pad_len];
    rng.fill_bytes(&mut padding);
    plaintext.extend_from_slice(&padding);
    plaintext.extend_from_slice(PublicKey::from(&ephemeral).as_bytes());
    plaintext.extend_from_slice(&sealed);

    let mut seed = [0u8; OBFUSCATION_SEED_LEN];
    rng.fill_bytes(&mut seed);
    obfuscation_cipher(obfuscated_key, &seed).apply_keystream(&mut plaintext);

    let mut raw = Vec::with_capacity(OBFUSCATION_SEED_LEN + plaintext.len());
    raw.extend_from_slice(&seed);
    raw.extend_from_slice(&plaintext);
    Ok(BASE64.encode(&raw))
}

fn obfuscation_cipher(obfuscated_key: &str, seed: &[u8]) -> Aes256Ctr {
    let mut key = Sha256::new();
    key.update(seed);
    key.update(obfuscated_key.as_bytes());
    let key: [u8; 32] = key.finalize().into();

    let mut iv = Sha256::new();
    iv.update(obfuscated_key.as_bytes());
    iv.update(seed);
    let iv: [u8; 32] = iv.finalize().into();
    let mut iv_bytes = [0u8; 16];
    iv_bytes.copy_from_slice(&iv[..16]);

    Aes256Ctr::new(&key.into(), &iv_bytes.into())
}

fn sealed_box_cipher(secret: &StaticSecret, public: &PublicKey) -> XChaCha20Poly1305 {
    let shared = secret.diffie_hellman(public);
    let key: [u8; 32] = Sha256::digest(shared.as_bytes()).into();
    XChaCha20Poly1305::new(&key.into())
}

fn zero_nonce() -> XNonce {
    XNonce::from([0u8; 24])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(&mut get_crypto_rng());
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    fn test_payload() -> CookiePayload {
        CookiePayload {
            version: 2,
            session_token: "sid".to_owned(),
            peer_address: "1.2.3.4".to_owned(),
        }
    }

    #[test]
    fn test_cookie_roundtrip() {
        let (secret, public) = test_keys();
        let payload = test_payload();

        let cookie = seal_cookie("obfuscation secret", &public, &payload).expect("seal");
        let decoded = decode_cookie("obfuscation secret", &secret, &cookie).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        let (secret, _) = test_keys();
        let result = decode_cookie("k", &secret, "not!base64!!");
        assert!(matches!(result, Err(MeekError::BadCookie(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_value() {
        let (secret, _) = test_keys();
        let short = BASE64.encode(&[0u8; 10]);
        let result = decode_cookie("k", &secret, &short);
        assert!(matches!(result, Err(MeekError::BadCookie(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_obfuscation_key() {
        let (secret, public) = test_keys();
        let cookie = seal_cookie("right key", &public, &test_payload()).expect("seal");
        let result = decode_cookie("wrong key", &secret, &cookie);
        assert!(matches!(result, Err(MeekError::BadCookie(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_server_key() {
        let (_, public) = test_keys();
        let (other_secret, _) = test_keys();
        let cookie = seal_cookie("k", &public, &test_payload()).expect("seal");
        let result = decode_cookie("k", &other_secret, &cookie);
        assert!(matches!(result, Err(MeekError::BadCookie(_))));
    }

    #[test]
    fn test_decode_rejects_tampered_ciphertext() {
        let (secret, public) = test_keys();
        let cookie = seal_cookie("k", &public, &test_payload()).expect("seal");
        let mut raw = BASE64.decode(cookie.as_bytes()).expect("base64");
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let result = decode_cookie("k", &secret, &BASE64.encode(&raw));
        assert!(matches!(result, Err(MeekError::BadCookie(_))));
    }

    #[test]
    fn test_private_key_parse_roundtrip() {
        let (secret, _) = test_keys();
        let encoded = BASE64.encode(secret.as_bytes());
        let parsed = parse_private_key(&encoded).expect("parse");
        assert_eq!(parsed.to_bytes(), secret.to_bytes());
    }

    #[test]
    fn test_private_key_rejects_wrong_length() {
        let encoded = BASE64.encode(&[0u8; 16]);
        assert!(matches!(
            parse_private_key(&encoded),
            Err(MeekError::InvalidPrivateKey)
        ));
    }
}
