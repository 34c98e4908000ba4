use crate::ProtoError;

/// A parsed monitoring package: `[stream_id][0x00][payload]`.
///
/// `payload` borrows from the datagram buffer it was parsed from so the
/// router can forward the original bytes verbatim without a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Package<'a> {
    pub stream_id: &'a str,
    pub payload: &'a [u8],
}

/// Parses a monitoring ingest datagram. The stream identifier is the UTF-8
/// text before the first `0x00`; an empty stream identifier is invalid.
pub fn parse_package(datagram: &[u8]) -> Result<Package<'_>, ProtoError> {
    let separator = datagram
        .iter()
        .position(|byte| *byte == 0x00)
        .ok_or(ProtoError::MissingStreamIdTerminator)?;

    if separator == 0 {
        return Err(ProtoError::EmptyStreamId);
    }

    let stream_id = std::str::from_utf8(&datagram[..separator])
        .map_err(|_| ProtoError::InvalidStreamIdUtf8)?;
    let payload = &datagram[separator + 1..];

    Ok(Package { stream_id, payload })
}

/// Encodes a monitoring package. Used by tests and renderer simulators; the
/// server itself never re-encodes a package, it forwards the raw datagram.
pub fn encode_package(stream_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(stream_id.len() + 1 + payload.len());
    bytes.extend_from_slice(stream_id.as_bytes());
    bytes.push(0x00);
    bytes.extend_from_slice(payload);
    bytes
}
