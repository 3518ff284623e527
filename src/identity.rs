//! Device identities and session crypto: session-key transport, signatures,
//! and the wire's symmetric transform.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangePublicKey, StaticSecret};

/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 16;

/// Detached signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

const SEALED_NONCE_LEN: usize = 12;
const SEALED_HEADER_LEN: usize = 32 + SEALED_NONCE_LEN;

/// Short-lived symmetric key established per connection. Bytes are scrubbed
/// on drop; a key must never outlive its session.
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a fresh key from the OS CSPRNG. Two independent calls never
    /// return the same bytes.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        SessionKey(bytes)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        // Best-effort scrub.
        self.0.fill(0);
    }
}

/// A device's long-lived private material: an X25519 static secret for key
/// transport and an Ed25519 key for signing. Pre-provisioned, never rotated.
pub struct LocalIdentity {
    exchange: StaticSecret,
    signing: SigningKey,
}

impl LocalIdentity {
    /// Generate fresh identity material (provisioning and tests).
    pub fn generate() -> Self {
        Self {
            exchange: StaticSecret::random_from_rng(OsRng),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild an identity from stored key material.
    pub fn from_bytes(exchange: [u8; 32], signing: [u8; 32]) -> Self {
        Self {
            exchange: StaticSecret::from(exchange),
            signing: SigningKey::from_bytes(&signing),
        }
    }

    /// The public half of this identity, as the other device provisions it.
    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            exchange: ExchangePublicKey::from(&self.exchange),
            verifying: self.signing.verifying_key(),
        }
    }
}

/// The trusted peer's public material: X25519 exchange key and Ed25519
/// verifying key.
#[derive(Clone)]
pub struct PeerIdentity {
    exchange: ExchangePublicKey,
    verifying: VerifyingKey,
}

impl PeerIdentity {
    /// Rebuild a peer identity from stored key material. Fails if the
    /// verifying key bytes are not a valid curve point.
    pub fn from_bytes(exchange: [u8; 32], verifying: [u8; 32]) -> Result<Self, CryptoError> {
        Ok(Self {
            exchange: ExchangePublicKey::from(exchange),
            verifying: VerifyingKey::from_bytes(&verifying)
                .map_err(|_| CryptoError::InvalidPeerKey)?,
        })
    }

    pub fn exchange_bytes(&self) -> [u8; 32] {
        self.exchange.to_bytes()
    }

    pub fn verifying_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }
}

fn derive_wrap_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tapdrop-keywrap-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Seal a session key for the peer: ephemeral X25519 exchange, SHA-256-derived
/// wrap key, ChaCha20-Poly1305. Layout: eph_pub(32) || nonce(12) || ciphertext.
pub fn seal_session_key(key: &SessionKey, peer: &PeerIdentity) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = ExchangePublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&peer.exchange);
    let wrap_key = derive_wrap_key(shared.as_bytes());

    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key).map_err(|_| CryptoError::Key)?;
    let mut nonce = [0u8; SEALED_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce);
    let ciphertext = cipher
        .encrypt(nonce_arr, key.as_bytes().as_slice())
        .map_err(|_| CryptoError::Seal)?;

    let mut out = Vec::with_capacity(SEALED_HEADER_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Recover a session key sealed for this device.
pub fn open_session_key(sealed: &[u8], local: &LocalIdentity) -> Result<SessionKey, CryptoError> {
    if sealed.len() < SEALED_HEADER_LEN {
        return Err(CryptoError::Malformed);
    }
    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&sealed[..32]);
    let shared = local
        .exchange
        .diffie_hellman(&ExchangePublicKey::from(ephemeral_public));
    let wrap_key = derive_wrap_key(shared.as_bytes());

    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key).map_err(|_| CryptoError::Key)?;
    let nonce_arr = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(
        &sealed[32..SEALED_HEADER_LEN],
    );
    let plain = cipher
        .decrypt(nonce_arr, &sealed[SEALED_HEADER_LEN..])
        .map_err(|_| CryptoError::Open)?;
    let bytes: [u8; SESSION_KEY_LEN] =
        plain.as_slice().try_into().map_err(|_| CryptoError::Malformed)?;
    Ok(SessionKey(bytes))
}

/// Detached signature over `bytes` with the local signing key.
pub fn sign(bytes: &[u8], local: &LocalIdentity) -> [u8; SIGNATURE_LEN] {
    local.signing.sign(bytes).to_bytes()
}

/// Verify a detached signature against the trusted peer identity.
pub fn verify(bytes: &[u8], signature: &[u8], peer: &PeerIdentity) -> bool {
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    peer.verifying.verify(bytes, &sig).is_ok()
}

/// Repeating-key byte-wise XOR: the wire's post-handshake confidentiality
/// layer. Self-inverse: applying it twice with the same key restores the
/// input. This is NOT an AEAD and offers no integrity; it is kept as-is for
/// wire compatibility. Do not upgrade it in place.
pub fn xor_transform(data: &[u8], key: &SessionKey) -> Vec<u8> {
    let key_bytes = key.as_bytes();
    data.iter()
        .enumerate()
        .map(|(i, &b)| b ^ key_bytes[i % SESSION_KEY_LEN])
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("sealing session key failed")]
    Seal,
    #[error("sealed session key rejected")]
    Open,
    #[error("malformed sealed session key")]
    Malformed,
    #[error("invalid peer key material")]
    InvalidPeerKey,
}
