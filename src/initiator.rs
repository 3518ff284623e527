//! Reader-side driver: runs the handshake, then pulls metadata and chunks
//! and reassembles them into a typed payload.

use crate::apdu;
use crate::identity::{self, CryptoError, LocalIdentity, PeerIdentity, SessionKey};
use crate::observer::{NullObserver, StepObserver};
use crate::payload::{FileEntry, ReceivedPayload};

/// Default cap on chunk requests per item, against a stalled or misbehaving
/// responder.
pub const DEFAULT_MAX_CHUNK_REQUESTS: usize = 50_000;

/// Half-duplex transport failure, as mapped by the host adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport timeout")]
    Timeout,
    #[error("link lost")]
    LinkLost,
    #[error("transport error: {0}")]
    Other(String),
}

/// Blocking half-duplex command/response seam. One call, one round trip;
/// per-round-trip timeout policy belongs to the implementation.
pub trait Transport {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Release the underlying connection. Default is a no-op.
    fn close(&mut self) {}
}

/// Why a transfer failed. Each variant carries a human-readable reason.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("selection failed")]
    SelectionFailed,
    #[error("key exchange rejected")]
    KeyExchangeFailed,
    #[error("signature rejected")]
    SignatureRejected,
    #[error("authentication rejected by responder")]
    AuthenticationRejected,
    #[error("metadata request failed")]
    MetadataFailed,
    #[error("truncated metadata payload")]
    TruncatedMetadata,
    #[error("chunk request failed before declared length was reached")]
    ChunkFailed,
    #[error("chunk request cap exceeded ({0} requests)")]
    ChunkCapExceeded(usize),
    #[error("unknown transfer mode {0:#04x}")]
    UnknownMode(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The active side of the protocol. Owns the identities and drives one
/// transfer at a time over a borrowed transport.
pub struct Initiator {
    local: LocalIdentity,
    peer: PeerIdentity,
    max_chunk_requests: usize,
    observer: Box<dyn StepObserver>,
}

impl Initiator {
    pub fn new(local: LocalIdentity, peer: PeerIdentity) -> Self {
        Self::with_observer(local, peer, Box::new(NullObserver))
    }

    pub fn with_observer(
        local: LocalIdentity,
        peer: PeerIdentity,
        observer: Box<dyn StepObserver>,
    ) -> Self {
        Self {
            local,
            peer,
            max_chunk_requests: DEFAULT_MAX_CHUNK_REQUESTS,
            observer,
        }
    }

    /// Set the per-item chunk request cap.
    pub fn set_max_chunk_requests(&mut self, cap: usize) {
        self.max_chunk_requests = cap;
    }

    /// Run one full transfer: select, handshake, metadata, chunk loops.
    /// The transport is closed and the session key dropped on every exit
    /// path; a key is never reused across invocations.
    pub fn run_transfer(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<ReceivedPayload, TransferError> {
        let result = self.drive(transport);
        transport.close();
        if let Err(ref e) = result {
            self.observer.on_protocol_step(&format!("transfer failed: {e}"));
        }
        result
    }

    fn drive(&mut self, transport: &mut dyn Transport) -> Result<ReceivedPayload, TransferError> {
        let resp = transport.transceive(&apdu::SELECT_APDU)?;
        if !apdu::is_success(&resp) {
            return Err(TransferError::SelectionFailed);
        }
        self.observer.on_protocol_step("connection established");

        // Session key lives exactly as long as this scope.
        let key = SessionKey::generate();
        let sealed = identity::seal_session_key(&key, &self.peer)?;
        let signature = identity::sign(&sealed, &self.local);

        let resp = transport.transceive(&apdu::tagged_command(apdu::CMD_AUTH_SEND_KEY, &sealed))?;
        if !apdu::is_success(&resp) {
            return Err(TransferError::KeyExchangeFailed);
        }
        self.observer.on_protocol_step("session key sent");

        let resp =
            transport.transceive(&apdu::tagged_command(apdu::CMD_AUTH_SEND_SIG, &signature))?;
        if !apdu::is_success(&resp) {
            return Err(TransferError::SignatureRejected);
        }
        let ack = identity::xor_transform(apdu::response_data(&resp), &key);
        if ack != apdu::AUTH_ACK {
            return Err(TransferError::AuthenticationRejected);
        }
        self.observer.on_protocol_step("authenticated");

        let metadata = self.request_metadata(transport, &key)?;
        let Some((&mode, rest)) = metadata.split_first() else {
            // An already-drained queue signals end-of-queue on the very
            // first metadata request.
            self.observer.on_protocol_step("transfer complete");
            return Ok(ReceivedPayload::Files(Vec::new()));
        };
        let received = match mode {
            apdu::MODE_TEXT => ReceivedPayload::Text(String::from_utf8_lossy(rest).into_owned()),
            apdu::MODE_FILE => {
                let (declared_len, mime) = parse_length_and_label(rest)?;
                let content = self.pull_chunks(transport, &key, declared_len)?;
                ReceivedPayload::File { mime, content }
            }
            apdu::MODE_MULTI => ReceivedPayload::Files(self.pull_queue(transport, &key, metadata)?),
            other => return Err(TransferError::UnknownMode(other)),
        };
        self.observer.on_protocol_step("transfer complete");
        Ok(received)
    }

    fn request_metadata(
        &mut self,
        transport: &mut dyn Transport,
        key: &SessionKey,
    ) -> Result<Vec<u8>, TransferError> {
        let resp = transport.transceive(apdu::CMD_GET_FILE_INFO)?;
        if !apdu::is_success(&resp) {
            return Err(TransferError::MetadataFailed);
        }
        Ok(identity::xor_transform(apdu::response_data(&resp), key))
    }

    /// Pull chunks until `declared_len` bytes arrive. Bounded: cap exhaustion
    /// is a failure, never silent truncation.
    fn pull_chunks(
        &mut self,
        transport: &mut dyn Transport,
        key: &SessionKey,
        declared_len: usize,
    ) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::with_capacity(declared_len);
        let mut requests = 0usize;
        while out.len() < declared_len {
            if requests >= self.max_chunk_requests {
                return Err(TransferError::ChunkCapExceeded(self.max_chunk_requests));
            }
            requests += 1;
            let resp = transport.transceive(apdu::CMD_GET_NEXT_CHUNK)?;
            if !apdu::is_success(&resp) {
                return Err(TransferError::ChunkFailed);
            }
            let chunk = identity::xor_transform(apdu::response_data(&resp), key);
            if chunk.is_empty() {
                // Responder ran out before the declared length.
                return Err(TransferError::ChunkFailed);
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Pull a whole queue: metadata, chunk loop, item-done marker, repeat
    /// until a metadata response arrives with an empty body.
    fn pull_queue(
        &mut self,
        transport: &mut dyn Transport,
        key: &SessionKey,
        first_metadata: Vec<u8>,
    ) -> Result<Vec<FileEntry>, TransferError> {
        let mut files = Vec::new();
        let mut metadata = first_metadata;
        loop {
            let Some((&mode, rest)) = metadata.split_first() else {
                // End-of-queue signal.
                break;
            };
            if mode != apdu::MODE_MULTI {
                return Err(TransferError::UnknownMode(mode));
            }
            let (declared_len, name) = parse_length_and_label(rest)?;
            let content = self.pull_chunks(transport, key, declared_len)?;

            // Consume the item-done marker so the responder advances its queue.
            let resp = transport.transceive(apdu::CMD_GET_NEXT_CHUNK)?;
            if !apdu::is_success(&resp) || !apdu::response_data(&resp).is_empty() {
                return Err(TransferError::ChunkFailed);
            }

            files.push(FileEntry { name, content });
            metadata = self.request_metadata(transport, key)?;
        }
        Ok(files)
    }
}

/// Split a metadata tail into its 4-byte big-endian declared length and the
/// trailing UTF-8 label (mime or file name).
fn parse_length_and_label(rest: &[u8]) -> Result<(usize, String), TransferError> {
    if rest.len() < 4 {
        return Err(TransferError::TruncatedMetadata);
    }
    let declared_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let label = String::from_utf8_lossy(&rest[4..]).into_owned();
    Ok((declared_len, label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::TransferPayload;
    use crate::responder::{AuthState, Responder};

    /// In-memory transport wiring the initiator straight into a responder.
    struct Loopback {
        responder: Responder,
        closed: bool,
    }

    impl Transport for Loopback {
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(self.responder.handle(command))
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn pair() -> (Initiator, Loopback) {
        let card = LocalIdentity::generate();
        let reader = LocalIdentity::generate();
        let card_public = card.peer_identity();
        let responder = Responder::new(card, reader.peer_identity());
        let initiator = Initiator::new(reader, card_public);
        (
            initiator,
            Loopback {
                responder,
                closed: false,
            },
        )
    }

    #[test]
    fn text_roundtrip() {
        let (mut initiator, mut transport) = pair();
        transport
            .responder
            .arm_transfer(TransferPayload::Text("tap to share".into()));

        let got = initiator.run_transfer(&mut transport).unwrap();
        assert_eq!(got, ReceivedPayload::Text("tap to share".into()));
        assert!(transport.closed);
    }

    #[test]
    fn file_roundtrip_boundary_lengths() {
        for len in [0usize, 1, 244, 245, 246, 245 * 20 + 17] {
            let (mut initiator, mut transport) = pair();
            let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            transport.responder.arm_transfer(TransferPayload::File {
                mime: "application/octet-stream".into(),
                content: content.clone(),
            });

            let got = initiator.run_transfer(&mut transport).unwrap();
            assert_eq!(
                got,
                ReceivedPayload::File {
                    mime: "application/octet-stream".into(),
                    content,
                },
                "length {len}"
            );
        }
    }

    #[test]
    fn two_item_queue_end_to_end() {
        let (mut initiator, mut transport) = pair();
        transport
            .responder
            .arm_transfer(TransferPayload::FileQueue(vec![
                FileEntry::new("a.txt", *b"hello"),
                FileEntry::new("b.txt", *b"world!!"),
            ]));

        let got = initiator.run_transfer(&mut transport).unwrap();
        assert_eq!(
            got,
            ReceivedPayload::Files(vec![
                FileEntry::new("a.txt", *b"hello"),
                FileEntry::new("b.txt", *b"world!!"),
            ])
        );
    }

    #[test]
    fn queue_preserves_order_and_handles_empty_items() {
        let (mut initiator, mut transport) = pair();
        let entries: Vec<FileEntry> = vec![
            FileEntry::new("0.bin", vec![7u8; 246]),
            FileEntry::new("1.bin", Vec::new()),
            FileEntry::new("2.bin", vec![9u8; 245]),
            FileEntry::new("3.bin", vec![1u8; 1000]),
        ];
        transport
            .responder
            .arm_transfer(TransferPayload::FileQueue(entries.clone()));

        let got = initiator.run_transfer(&mut transport).unwrap();
        assert_eq!(got, ReceivedPayload::Files(entries));
    }

    #[test]
    fn empty_queue_yields_no_files() {
        let (mut initiator, mut transport) = pair();
        transport
            .responder
            .arm_transfer(TransferPayload::FileQueue(Vec::new()));

        let got = initiator.run_transfer(&mut transport).unwrap();
        assert_eq!(got, ReceivedPayload::Files(Vec::new()));
    }

    #[test]
    fn nothing_armed_fails_metadata() {
        let (mut initiator, mut transport) = pair();
        let err = initiator.run_transfer(&mut transport).unwrap_err();
        assert!(matches!(err, TransferError::MetadataFailed));
        assert!(transport.closed);
    }

    #[test]
    fn chunk_cap_bounds_the_transfer() {
        let (mut initiator, mut transport) = pair();
        initiator.set_max_chunk_requests(2);
        transport.responder.arm_transfer(TransferPayload::File {
            mime: "application/octet-stream".into(),
            content: vec![0u8; 245 * 4],
        });

        let err = initiator.run_transfer(&mut transport).unwrap_err();
        assert!(matches!(err, TransferError::ChunkCapExceeded(2)));
    }

    /// Transport that corrupts signature frames in flight.
    struct SignatureTamperer(Loopback);

    impl Transport for SignatureTamperer {
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            if command.starts_with(apdu::CMD_AUTH_SEND_SIG) {
                let mut corrupted = command.to_vec();
                let last = corrupted.len() - 1;
                corrupted[last] ^= 0x01;
                return self.0.transceive(&corrupted);
            }
            self.0.transceive(command)
        }

        fn close(&mut self) {
            self.0.close();
        }
    }

    #[test]
    fn tampered_signature_aborts_handshake() {
        let (mut initiator, transport) = pair();
        let mut tampering = SignatureTamperer(transport);

        let err = initiator.run_transfer(&mut tampering).unwrap_err();
        assert!(matches!(err, TransferError::SignatureRejected));
        assert_ne!(
            tampering.0.responder.auth_state(),
            AuthState::Authenticated
        );
        assert!(tampering.0.closed);
    }

    #[test]
    fn untrusted_initiator_is_rejected() {
        let card = LocalIdentity::generate();
        let reader = LocalIdentity::generate();
        let mallory = LocalIdentity::generate();
        let card_public = card.peer_identity();
        // The card trusts the reader, but mallory drives the transfer.
        let responder = Responder::new(card, reader.peer_identity());
        let mut transport = Loopback {
            responder,
            closed: false,
        };
        let mut initiator = Initiator::new(mallory, card_public);

        let err = initiator.run_transfer(&mut transport).unwrap_err();
        assert!(matches!(err, TransferError::SignatureRejected));
        assert_ne!(transport.responder.auth_state(), AuthState::Authenticated);
    }

    /// Transport that corrupts the mode tag of metadata responses. The XOR
    /// layer is malleable, so flipping the encrypted byte flips the
    /// decrypted tag the same way: 'T' becomes 0x01.
    struct BogusModeTransport(Loopback);

    impl Transport for BogusModeTransport {
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            let mut resp = self.0.transceive(command)?;
            if command == apdu::CMD_GET_FILE_INFO && resp.len() > 2 {
                resp[0] ^= apdu::MODE_TEXT ^ 0x01;
            }
            Ok(resp)
        }
    }

    #[test]
    fn unknown_mode_tag_fails() {
        let (mut initiator, transport) = pair();
        let mut bogus = BogusModeTransport(transport);
        bogus
            .0
            .responder
            .arm_transfer(TransferPayload::Text("ignored".into()));

        let err = initiator.run_transfer(&mut bogus).unwrap_err();
        assert!(matches!(err, TransferError::UnknownMode(0x01)));
    }

    #[test]
    fn transport_failure_propagates() {
        struct DeadTransport;
        impl Transport for DeadTransport {
            fn transceive(&mut self, _command: &[u8]) -> Result<Vec<u8>, TransportError> {
                Err(TransportError::Timeout)
            }
        }

        let reader = LocalIdentity::generate();
        let card = LocalIdentity::generate();
        let mut initiator = Initiator::new(reader, card.peer_identity());
        let err = initiator.run_transfer(&mut DeadTransport).unwrap_err();
        assert!(matches!(
            err,
            TransferError::Transport(TransportError::Timeout)
        ));
    }

    #[test]
    fn observer_sees_handshake_milestones() {
        use std::cell::RefCell;
        use std::rc::Rc;

        #[derive(Clone, Default)]
        struct Recorder(Rc<RefCell<Vec<String>>>);
        impl StepObserver for Recorder {
            fn on_protocol_step(&mut self, message: &str) {
                self.0.borrow_mut().push(message.to_owned());
            }
        }

        let card = LocalIdentity::generate();
        let reader = LocalIdentity::generate();
        let card_public = card.peer_identity();
        let responder = Responder::new(card, reader.peer_identity());
        let recorder = Recorder::default();
        let mut initiator =
            Initiator::with_observer(reader, card_public, Box::new(recorder.clone()));
        let mut transport = Loopback {
            responder,
            closed: false,
        };
        transport
            .responder
            .arm_transfer(TransferPayload::Text("hi".into()));

        initiator.run_transfer(&mut transport).unwrap();
        let expected: Vec<String> = [
            "connection established",
            "session key sent",
            "authenticated",
            "transfer complete",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(*recorder.0.borrow(), expected);
    }
}
