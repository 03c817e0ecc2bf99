//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Length-prefix sniffing of binary documents."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Classify a buffer as a complete binary document or an opaque fragment.
//!
//! A document declares its own total length in its first four bytes
//! (little-endian `u32`). A buffer whose prefix disagrees with its length is
//! treated as opaque without attempting to decode it, which lets one channel
//! carry both metadata documents and raw payload chunks.
use bson::Document;

/// Smallest buffer that can hold a length prefix plus a terminator.
pub const MIN_DOCUMENT_LEN: usize = 5;

/// Result of [`sniff`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sniffed {
    /// The buffer is a complete document of `length` bytes.
    Document {
        /// Declared and actual byte length.
        length: u32,
        /// Decoded document.
        document: Document,
    },
    /// The buffer is not a document.
    Opaque,
}

impl Sniffed {
    /// The decoded document, if any.
    pub fn into_document(self) -> Option<Document> {
        match self {
            Sniffed::Document { document, .. } => Some(document),
            Sniffed::Opaque => None,
        }
    }

    /// Whether a document was recognised.
    pub fn is_document(&self) -> bool {
        matches!(self, Sniffed::Document { .. })
    }
}

/// Classify the first `length` bytes of `buffer`.
pub fn sniff(buffer: &[u8], length: usize) -> Sniffed {
    if length < MIN_DOCUMENT_LEN || length > buffer.len() {
        return Sniffed::Opaque;
    }
    let bytes = &buffer[..length];
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if declared as usize != length {
        return Sniffed::Opaque;
    }
    match Document::from_reader(bytes) {
        Ok(document) => Sniffed::Document {
            length: declared,
            document,
        },
        Err(_) => Sniffed::Opaque,
    }
}

/// Decode `bytes` as a document when its prefix matches its length.
pub fn try_decode_document(bytes: &[u8]) -> Option<Document> {
    sniff(bytes, bytes.len()).into_document()
}

/// Serialize a document into its length-prefixed wire form.
pub fn encode_document(document: &Document) -> crate::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    Ok(bytes)
}
