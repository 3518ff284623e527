//! Card-side state machine: dispatches inbound APDU frames to handlers.
//! Host-driven and synchronous; one frame in, one response out, no I/O.

use crate::apdu;
use crate::identity::{self, LocalIdentity, PeerIdentity, SessionKey};
use crate::observer::{NullObserver, StepObserver};
use crate::payload::TransferPayload;

/// Per-connection authentication progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    KeyReceived,
    Authenticated,
}

/// Why the transport link went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deactivation {
    /// Transient link loss: keep the armed payload so a retry can re-run the
    /// handshake without re-arming.
    LinkLost,
    /// Application-level reset: clear payload and key material.
    Reset,
}

/// Session-local snapshot of the armed payload plus transfer cursors.
/// Taken at connection-select so a payload re-armed mid-session cannot
/// change underneath an in-flight transfer.
struct Session {
    payload: Option<TransferPayload>,
    queue_index: usize,
    chunk_offset: usize,
}

impl Session {
    fn empty() -> Self {
        Self {
            payload: None,
            queue_index: 0,
            chunk_offset: 0,
        }
    }
}

/// The passive side of the protocol. Holds authentication state, the active
/// session key, and the payload armed for transfer; at most one session's
/// state exists at a time.
pub struct Responder {
    local: LocalIdentity,
    peer: PeerIdentity,
    auth: AuthState,
    session_key: Option<SessionKey>,
    pending_sealed_key: Option<Vec<u8>>,
    armed: Option<TransferPayload>,
    session: Session,
    observer: Box<dyn StepObserver>,
}

impl Responder {
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
            auth: AuthState::Idle,
            session_key: None,
            pending_sealed_key: None,
            armed: None,
            session: Session::empty(),
            observer,
        }
    }

    /// Arm a payload for the next connection. Does not touch an in-flight
    /// session: the snapshot taken at select stays authoritative.
    pub fn arm_transfer(&mut self, payload: TransferPayload) {
        self.armed = Some(payload);
    }

    /// Clear the armed payload and all session state.
    pub fn reset_transfer(&mut self) {
        self.armed = None;
        self.clear_session();
    }

    /// Transport deactivation signal from the host.
    pub fn on_deactivated(&mut self, reason: Deactivation) {
        self.clear_session();
        if reason == Deactivation::Reset {
            self.armed = None;
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    /// Process one inbound command frame and produce the response frame.
    pub fn handle(&mut self, frame: &[u8]) -> Vec<u8> {
        let response = self.dispatch(frame);
        self.seal_response(response)
    }

    fn dispatch(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame == apdu::SELECT_APDU {
            self.clear_session();
            self.session.payload = self.armed.clone();
            self.observer.on_protocol_step("connection established");
            return apdu::SW_SUCCESS.to_vec();
        }

        if let Some(sealed) = frame.strip_prefix(apdu::CMD_AUTH_SEND_KEY) {
            // Loosely gated: arriving here from any state just overwrites
            // prior key material.
            self.pending_sealed_key = Some(sealed.to_vec());
            self.auth = AuthState::KeyReceived;
            self.observer.on_protocol_step("session key received");
            return apdu::SW_SUCCESS.to_vec();
        }

        if let Some(signature) = frame.strip_prefix(apdu::CMD_AUTH_SEND_SIG) {
            return self.handle_signature(signature);
        }

        if self.auth != AuthState::Authenticated {
            return apdu::SW_NOT_READY.to_vec();
        }
        self.handle_data(frame)
    }

    fn handle_signature(&mut self, signature: &[u8]) -> Vec<u8> {
        if self.auth != AuthState::KeyReceived {
            return apdu::SW_UNKNOWN_CMD.to_vec();
        }
        let Some(sealed) = self.pending_sealed_key.take() else {
            return apdu::SW_UNKNOWN_CMD.to_vec();
        };
        if !identity::verify(&sealed, signature, &self.peer) {
            // Stay in KeyReceived; the initiator may retry or re-select.
            self.pending_sealed_key = Some(sealed);
            self.observer.on_protocol_step("authentication failed");
            return apdu::SW_UNKNOWN_CMD.to_vec();
        }
        match identity::open_session_key(&sealed, &self.local) {
            Ok(key) => {
                self.session_key = Some(key);
                self.auth = AuthState::Authenticated;
                self.observer.on_protocol_step("authenticated");
                apdu::with_status(apdu::AUTH_ACK, &apdu::SW_SUCCESS)
            }
            Err(_) => {
                self.pending_sealed_key = Some(sealed);
                self.observer.on_protocol_step("authentication failed");
                apdu::SW_UNKNOWN_CMD.to_vec()
            }
        }
    }

    fn handle_data(&mut self, frame: &[u8]) -> Vec<u8> {
        let session = &mut self.session;
        match session.payload {
            None => apdu::SW_NOT_READY.to_vec(),

            Some(TransferPayload::Text(ref text)) => {
                if frame != apdu::CMD_GET_FILE_INFO {
                    return apdu::SW_UNKNOWN_CMD.to_vec();
                }
                let mut body = vec![apdu::MODE_TEXT];
                body.extend_from_slice(text.as_bytes());
                apdu::with_status(&body, &apdu::SW_SUCCESS)
            }

            Some(TransferPayload::File {
                ref mime,
                ref content,
            }) => {
                if frame == apdu::CMD_GET_FILE_INFO {
                    let body =
                        apdu::metadata_body(apdu::MODE_FILE, content.len() as u32, mime.as_bytes());
                    apdu::with_status(&body, &apdu::SW_SUCCESS)
                } else if frame == apdu::CMD_GET_NEXT_CHUNK {
                    let remaining = content.len().saturating_sub(session.chunk_offset);
                    if remaining == 0 {
                        return apdu::SW_NOT_READY.to_vec();
                    }
                    let take = remaining.min(apdu::MAX_CHUNK_LEN);
                    let chunk = &content[session.chunk_offset..session.chunk_offset + take];
                    let response = apdu::with_status(chunk, &apdu::SW_SUCCESS);
                    session.chunk_offset += take;
                    response
                } else {
                    apdu::SW_UNKNOWN_CMD.to_vec()
                }
            }

            Some(TransferPayload::FileQueue(ref files)) => {
                if frame == apdu::CMD_GET_FILE_INFO {
                    let Some(file) = files.get(session.queue_index) else {
                        // End-of-queue: empty body, success.
                        return apdu::SW_SUCCESS.to_vec();
                    };
                    session.chunk_offset = 0;
                    let body = apdu::metadata_body(
                        apdu::MODE_MULTI,
                        file.content.len() as u32,
                        file.name.as_bytes(),
                    );
                    apdu::with_status(&body, &apdu::SW_SUCCESS)
                } else if frame == apdu::CMD_GET_NEXT_CHUNK {
                    let Some(file) = files.get(session.queue_index) else {
                        return apdu::SW_NOT_READY.to_vec();
                    };
                    let remaining = file.content.len().saturating_sub(session.chunk_offset);
                    if remaining == 0 {
                        // Item done: advance the queue and signal with an
                        // empty body, distinct from a data chunk.
                        session.queue_index += 1;
                        session.chunk_offset = 0;
                        return apdu::SW_SUCCESS.to_vec();
                    }
                    let take = remaining.min(apdu::MAX_CHUNK_LEN);
                    let chunk = &file.content[session.chunk_offset..session.chunk_offset + take];
                    let response = apdu::with_status(chunk, &apdu::SW_SUCCESS);
                    session.chunk_offset += take;
                    response
                } else {
                    apdu::SW_UNKNOWN_CMD.to_vec()
                }
            }
        }
    }

    /// Pass a non-empty response body through the symmetric transform.
    /// Status words stay in clear.
    fn seal_response(&self, response: Vec<u8>) -> Vec<u8> {
        if response.len() <= 2 {
            return response;
        }
        let Some(ref key) = self.session_key else {
            return response;
        };
        let split = response.len() - 2;
        let mut out = identity::xor_transform(&response[..split], key);
        out.extend_from_slice(&response[split..]);
        out
    }

    fn clear_session(&mut self) {
        self.auth = AuthState::Idle;
        self.session_key = None;
        self.pending_sealed_key = None;
        self.session = Session::empty();
    }
}
