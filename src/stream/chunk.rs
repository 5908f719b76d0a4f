use std::time::SystemTime;

/// Maximum raw payload size for one chunk. Longer payloads are truncated.
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Buffer cap per session. On overflow the buffer is compacted to the first
/// `COMPACT_HEAD` chunks plus the newest remainder — completed messages are
/// extracted into a single string, so dropping mid-stream history is safe.
pub const MAX_BUFFERED_CHUNKS: usize = 10_000;
pub const COMPACT_HEAD: usize = 100;

/// Provider end-of-stream sentinel as stored in the buffer.
pub const DONE_PAYLOAD: &str = "data: [DONE]";

/// One SSE line plus metadata. Indices are contiguous from 0 within a session.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub index: u64,
    /// The raw `data: `-prefixed line as received (or synthesized).
    pub payload: String,
    pub received_at: SystemTime,
    /// True iff the payload is the end-of-stream sentinel.
    pub is_final: bool,
    /// True iff the payload carries an error object.
    pub is_error: bool,
}

impl StreamChunk {
    pub fn new(index: u64, payload: String, is_final: bool, is_error: bool) -> Self {
        let payload = truncate_payload(payload);
        Self {
            index,
            payload,
            received_at: SystemTime::now(),
            is_final,
            is_error,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Parse the JSON object after the `data: ` prefix. None for the
    /// `[DONE]` sentinel and non-JSON payloads.
    pub fn data_json(&self) -> Option<serde_json::Value> {
        let data = self.payload.strip_prefix("data: ")?;
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }
}

/// Cap a payload at `MAX_CHUNK_BYTES`, cutting back to a char boundary.
pub fn truncate_payload(payload: String) -> String {
    if payload.len() <= MAX_CHUNK_BYTES {
        return payload;
    }
    let mut cut = MAX_CHUNK_BYTES;
    while cut > 0 && !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    tracing::warn!(
        original = payload.len(),
        truncated = cut,
        "oversized chunk truncated"
    );
    let mut payload = payload;
    payload.truncate(cut);
    payload
}
