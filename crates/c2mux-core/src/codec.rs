//! CBOR encoding for envelopes and their typed payloads.
//!
//! Framing (length prefixes, TLS records) belongs to the transport; this
//! module only turns values into CBOR bytes and back.

use crate::error::{MuxError, MuxResult};
use crate::messages::Envelope;
use std::io::Cursor;

/// Encode a serializable value as a CBOR payload.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> MuxResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> MuxResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Decode one complete envelope handed over by a transport.
///
/// Empty input is rejected explicitly so a zero-length read never turns into
/// a confusing CBOR EOF error.
pub fn decode_envelope(data: &[u8]) -> MuxResult<Envelope> {
    if data.is_empty() {
        return Err(MuxError::InvalidMessage("empty envelope".into()));
    }
    cbor_decode(data)
}

/// Encode an envelope for a transport to frame and send.
pub fn encode_envelope(envelope: &Envelope) -> MuxResult<Vec<u8>> {
    cbor_encode(envelope)
}
