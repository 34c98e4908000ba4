use crate::ProtoError;

/// A parsed device keepalive: `"<frames> <rendered>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceKeepalive {
    pub frames: u64,
    pub rendered: u64,
}

/// Parses a device keepalive datagram body. Malformed input (bad UTF-8,
/// wrong field count, non-decimal fields) is reported as a single error
/// variant; callers drop the datagram either way.
pub fn parse_device_keepalive(bytes: &[u8]) -> Result<DeviceKeepalive, ProtoError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtoError::InvalidKeepaliveUtf8)?;
    let mut fields = text.trim().splitn(2, ' ');
    let malformed = || ProtoError::MalformedKeepalive(text.to_string());

    let frames_str = fields.next().ok_or_else(malformed)?;
    let rendered_str = fields.next().ok_or_else(malformed)?;

    let frames: u64 = frames_str.parse().map_err(|_| malformed())?;
    let rendered: u64 = rendered_str.parse().map_err(|_| malformed())?;

    Ok(DeviceKeepalive { frames, rendered })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_keepalive() {
        let keepalive = parse_device_keepalive(b"10 11").unwrap();
        assert_eq!(keepalive, DeviceKeepalive { frames: 10, rendered: 11 });
    }

    #[test]
    fn rejects_missing_second_field() {
        assert!(parse_device_keepalive(b"10").is_err());
    }

    #[test]
    fn rejects_non_decimal_field() {
        assert!(parse_device_keepalive(b"10 abc").is_err());
    }

    #[test]
    fn rejects_non_utf8() {
        assert_eq!(
            parse_device_keepalive(&[0xFF, 0xFE]),
            Err(ProtoError::InvalidKeepaliveUtf8)
        );
    }
}
