// Payload decoding seam. The broker hands the client raw bytes; a codec turns
// them into the string value handed to listeners. Decode failures are logged
// by the dispatch path and never fail a message on their own.
use anyhow::{Context, Result};

pub trait Codec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<String>;
}

/// JSON string schema: the payload is a JSON-encoded string value.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStringCodec;

impl Codec for JsonStringCodec {
    fn decode(&self, payload: &[u8]) -> Result<String> {
        serde_json::from_slice(payload).context("decode json string payload")
    }
}

/// Raw UTF-8 payloads, no framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    fn decode(&self, payload: &[u8]) -> Result<String> {
        Ok(std::str::from_utf8(payload)
            .context("decode utf-8 payload")?
            .to_string())
    }
}
