//! Transfer payload model: what the responder is armed with and what the
//! initiator reassembles.

/// A named byte blob in a multi-file queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub content: Vec<u8>,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// What the host arms the responder with before a connection. Read-only
/// during a transfer; the responder snapshots it at connection-select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPayload {
    /// A text blob, delivered whole inside the metadata response.
    Text(String),
    /// A single file, streamed in chunks after a metadata exchange.
    File { mime: String, content: Vec<u8> },
    /// An ordered queue of named files, streamed one at a time.
    FileQueue(Vec<FileEntry>),
}

/// The initiator's reassembled result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedPayload {
    Text(String),
    File { mime: String, content: Vec<u8> },
    Files(Vec<FileEntry>),
}
