use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix carried by every access token.
pub const TOKEN_PREFIX: &str = "tsk_";

const SECRET_BYTES: usize = 32;
// 32 bytes -> 43 base64url characters without padding.
const BODY_LEN: usize = 43;

/// Total token length, prefix included.
pub const TOKEN_LEN: usize = TOKEN_PREFIX.len() + BODY_LEN;

/// A freshly generated bearer secret. Only its hash is stored; the plain
/// value is handed out once at issue time.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSecret(String);

impl TokenSecret {
    pub(crate) fn generate() -> Self {
        let bytes: [u8; SECRET_BYTES] = rand::random();
        Self(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// The bearer string to give to the client.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub(crate) fn hash(&self) -> SecretHash {
        SecretHash::of(&self.0)
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(***)")
    }
}

/// SHA-256 of a bearer string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SecretHash([u8; 32]);

impl SecretHash {
    pub(crate) fn of(raw: &str) -> Self {
        Self(Sha256::digest(raw.as_bytes()).into())
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Cheap shape check done before any lookup.
pub(crate) fn well_formed(raw: &str) -> bool {
    let Some(body) = raw.strip_prefix(TOKEN_PREFIX) else { return false };
    body.len() == BODY_LEN
        && body.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        && URL_SAFE_NO_PAD.decode(body).map_or(false, |bytes| bytes.len() == SECRET_BYTES)
}
