//! APDU wire constants and frame helpers: status words, command tags, chunk limit.

/// Success status word, trailing 2 bytes of a good response.
pub const SW_SUCCESS: [u8; 2] = [0x90, 0x00];
/// Unknown-command status word.
pub const SW_UNKNOWN_CMD: [u8; 2] = [0x00, 0x00];
/// Data-not-ready status word (nothing armed, or stream exhausted).
pub const SW_NOT_READY: [u8; 2] = [0x6A, 0x88];

/// Application identifier the responder registers under.
pub const AID: [u8; 7] = [0xF0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

/// Connection-select APDU: CLA, INS, P1, P2, LC, 7-byte AID, LE.
pub const SELECT_APDU: [u8; 13] = [
    0x00, 0xA4, 0x04, 0x00, 0x07, 0xF0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00,
];

/// Handshake tag: sealed session key follows.
pub const CMD_AUTH_SEND_KEY: &[u8] = b"AUTH_KEY";
/// Handshake tag: signature over the sealed session key follows.
pub const CMD_AUTH_SEND_SIG: &[u8] = b"AUTH_SIG";

/// Request payload metadata (mode tag, declared length, label).
pub const CMD_GET_FILE_INFO: &[u8] = b"GET_FILE_INFO";
/// Request the next data chunk of the current item.
pub const CMD_GET_NEXT_CHUNK: &[u8] = b"GET_NEXT_CHUNK";

/// Acknowledgement literal returned (encrypted) when the handshake completes.
pub const AUTH_ACK: &[u8] = b"AUTH_OK";

/// Metadata mode tags.
pub const MODE_TEXT: u8 = b'T';
pub const MODE_FILE: u8 = b'F';
pub const MODE_MULTI: u8 = b'M';

/// Maximum data bytes per chunk response, pre-encryption. Leaves headroom
/// under the transport's frame limit after status-word framing.
pub const MAX_CHUNK_LEN: usize = 245;

/// Append a status word to a response body.
pub fn with_status(body: &[u8], sw: &[u8; 2]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    out.extend_from_slice(body);
    out.extend_from_slice(sw);
    out
}

/// Build a tagged command frame: tag immediately followed by the body.
pub fn tagged_command(tag: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + body.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    out
}

/// Whether a response ends in the success status word.
pub fn is_success(response: &[u8]) -> bool {
    response.len() >= 2 && response[response.len() - 2..] == SW_SUCCESS
}

/// The data portion of a response (everything before the status word).
pub fn response_data(response: &[u8]) -> &[u8] {
    if response.len() < 2 {
        return &[];
    }
    &response[..response.len() - 2]
}

/// Metadata body: mode tag, 4-byte big-endian declared length, UTF-8 label.
pub fn metadata_body(mode: u8, declared_len: u32, label: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + label.len());
    out.push(mode);
    out.extend_from_slice(&declared_len.to_be_bytes());
    out.extend_from_slice(label);
    out
}
