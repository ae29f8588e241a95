//! Authentication plugins used during the handshake.
//!
//! | plugin | first response |
//! |---|---|
//! | `mysql_native_password` | `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))` |
//! | `caching_sha2_password` | `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)` |
//! | `mysql_clear_password` | `pw` + NUL |
//!
//! `caching_sha2_password` may ask for full authentication when the server
//! has no cached entry for the account. Without TLS the password is then
//! sent RSA-encrypted with the server's public key (see [`encrypt_password`]).

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use sqlreap_core::error::{ConnectionError, ConnectionErrorKind};
use sqlreap_core::{Error, Result};

/// Status bytes sent by the server after a `caching_sha2_password` scramble.
pub mod caching_sha2 {
    /// Sent by the client to ask for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// An authentication plugin the client can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    ClearPassword,
}

impl AuthPlugin {
    /// Look a plugin up by the name the server announces.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mysql_native_password" => Some(AuthPlugin::NativePassword),
            "caching_sha2_password" => Some(AuthPlugin::CachingSha2Password),
            "mysql_clear_password" => Some(AuthPlugin::ClearPassword),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2Password => "caching_sha2_password",
            AuthPlugin::ClearPassword => "mysql_clear_password",
        }
    }

    /// The auth response for `password` against the server's `seed`.
    ///
    /// An empty password yields an empty response for the hashing plugins.
    pub fn scramble(self, password: &str, seed: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::NativePassword => native_password(password, seed),
            AuthPlugin::CachingSha2Password => caching_sha2_password(password, seed),
            AuthPlugin::ClearPassword => {
                let mut out = password.as_bytes().to_vec();
                out.push(0);
                out
            }
        }
    }
}

/// The handshake sends 20 scramble bytes followed by a NUL.
fn trim_seed(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ if seed.len() > 20 => &seed[..20],
        _ => seed,
    }
}

fn native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = trim_seed(seed);

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mixed = Sha1::new().chain_update(seed).chain_update(stage2).finalize();

    xor(&stage1, &mixed)
}

fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = trim_seed(seed);

    let hashed = Sha256::digest(password.as_bytes());
    let double_hashed = Sha256::digest(hashed);
    let mixed = Sha256::new()
        .chain_update(double_hashed)
        .chain_update(seed)
        .finalize();

    xor(&hashed, &mixed)
}

fn xor(left: &[u8], right: &[u8]) -> Vec<u8> {
    left.iter().zip(right).map(|(a, b)| a ^ b).collect()
}

/// Encrypt the password for `caching_sha2_password` full authentication.
///
/// The NUL-terminated password is XORed with the rotating seed and
/// encrypted with RSA-OAEP(SHA1) under the PEM key the server sent. Both
/// SPKI and PKCS#1 PEM encodings are accepted.
#[allow(clippy::result_large_err)]
pub fn encrypt_password(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    let seed = trim_seed(seed);
    if seed.is_empty() {
        return Err(auth_error("server sent an empty auth seed"));
    }

    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("server public key is not PEM text: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("cannot parse server public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| auth_error(format!("RSA encryption failed: {e}")))
}

pub(crate) fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}
