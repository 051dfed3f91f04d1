/// Payload confidentiality and capsule signatures.
///
/// Packets between hubs are sealed with a shared 32-byte session key using
/// ChaCha20-Poly1305 (12-byte random nonce per call). The sealed wire form
/// is `nonce ++ ciphertext`.
///
/// Capsules are signed with Ed25519. Keys and signatures travel as
/// standard base64 text.
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};

use crate::ArcProtocolError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Passphrase used when no session key is configured.
pub const DEFAULT_SESSION_PASSPHRASE: &str = "demo-session-key-32-bytes-demo-key";

// ── Session key ─────────────────────────────────────────────────────

/// Shared symmetric key for hub-to-hub payloads.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Exactly 32 bytes, anything else is a configuration error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArcProtocolError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            ArcProtocolError::Config(format!(
                "session key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// UTF-8 passphrase right-padded with `'0'` or truncated to 32 bytes.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut key = [b'0'; KEY_LEN];
        let raw = passphrase.as_bytes();
        let n = raw.len().min(KEY_LEN);
        key[..n].copy_from_slice(&raw[..n]);
        Self(key)
    }

    /// `ARC_AI_SESSION_KEY` passphrase, or the built-in demo key.
    pub fn from_env() -> Self {
        let passphrase = std::env::var("ARC_AI_SESSION_KEY")
            .unwrap_or_else(|_| DEFAULT_SESSION_PASSPHRASE.to_string());
        Self::from_passphrase(&passphrase)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::from_passphrase(DEFAULT_SESSION_PASSPHRASE)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

// ── Sealed envelope ─────────────────────────────────────────────────

/// Nonce and ciphertext (tag included) of one sealed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl SealedEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split `nonce ++ ciphertext`. Too-short input is an integrity error.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ArcProtocolError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(ArcProtocolError::Crypto(format!(
                "sealed payload too short: {} bytes",
                data.len()
            )));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);
        Ok(Self {
            nonce: nonce_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AEAD cipher bound to one session key.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&(*key.as_bytes()).into()),
        }
    }

    pub fn seal(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<SealedEnvelope, ArcProtocolError> {
        use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: aad.unwrap_or_default(),
                },
            )
            .map_err(|e| ArcProtocolError::Crypto(format!("encryption failed: {e}")))?;

        Ok(SealedEnvelope { nonce, ciphertext })
    }

    pub fn open(&self, envelope: &SealedEnvelope, aad: Option<&[u8]>) -> Result<Vec<u8>, ArcProtocolError> {
        self.cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &envelope.ciphertext,
                    aad: aad.unwrap_or_default(),
                },
            )
            .map_err(|_| {
                ArcProtocolError::Crypto("decryption failed: authentication error".into())
            })
    }

    /// Seal and return the wire bytes.
    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>, ArcProtocolError> {
        Ok(self.seal(plaintext, None)?.to_bytes())
    }

    /// Parse wire bytes and open them.
    pub fn open_bytes(&self, data: &[u8]) -> Result<Vec<u8>, ArcProtocolError> {
        self.open(&SealedEnvelope::from_bytes(data)?, None)
    }
}

// ── Signatures ──────────────────────────────────────────────────────

/// Ed25519 keypair of the authority.
#[derive(Clone)]
pub struct SigningKeypair {
    signing_key: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load from a base64-encoded 32-byte seed.
    pub fn from_base64(signing_key_b64: &str) -> Result<Self, ArcProtocolError> {
        let raw = BASE64
            .decode(signing_key_b64.trim())
            .map_err(|e| ArcProtocolError::Config(format!("signing key is not base64: {e}")))?;
        let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            ArcProtocolError::Config(format!("signing key must be 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self::from_seed(&seed))
    }

    pub fn signing_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.to_bytes())
    }

    pub fn verify_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `payload`, returning the base64 signature.
    pub fn sign(&self, payload: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(payload).to_bytes())
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("verify_key", &self.verify_key_base64())
            .finish()
    }
}

/// Verify a base64 signature over `payload` with a base64 verify key.
///
/// Malformed keys or signatures verify as `false`.
pub fn verify_signature(payload: &[u8], signature_b64: &str, verify_key_b64: &str) -> bool {
    let Ok(key_bytes) = BASE64.decode(verify_key_b64.trim()) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying_key.verify_strict(payload, &signature).is_ok()
}
