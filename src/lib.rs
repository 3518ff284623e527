//! Tapdrop tap-to-transfer protocol reference implementation.
//! Host-driven: no I/O; the host passes APDU frames and receives responses.

pub mod apdu;
pub mod identity;
pub mod initiator;
pub mod observer;
pub mod payload;
pub mod responder;

pub use identity::{CryptoError, LocalIdentity, PeerIdentity, SessionKey};
pub use initiator::{
    Initiator, TransferError, Transport, TransportError, DEFAULT_MAX_CHUNK_REQUESTS,
};
pub use observer::{NullObserver, StepObserver};
pub use payload::{FileEntry, ReceivedPayload, TransferPayload};
pub use responder::{AuthState, Deactivation, Responder};
