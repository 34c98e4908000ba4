use crate::ProtoError;

/// Maximum registration frame size accepted off the wire, including the
/// 2-byte port field. Device IDs are short human-assigned strings; this just
/// keeps a misbehaving peer from forcing an unbounded read buffer.
#[cfg(feature = "tokio")]
const MAX_REGISTRATION_FRAME_LEN: usize = 4096;

const PORT_FIELD_LEN: usize = 2;

/// A decoded device registration frame: `[u16 port][UTF-8 device_id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationFrame {
    pub port: u16,
    pub device_id: String,
}

/// Parses the bytes preceding the `0x0A` terminator (the terminator itself
/// must already be stripped by the caller).
pub fn parse_registration_frame(
    bytes: &[u8],
) -> Result<RegistrationFrame, ProtoError> {
    if bytes.len() < PORT_FIELD_LEN {
        return Err(ProtoError::RegistrationFrameTooShort);
    }
    let port = u16::from_be_bytes([bytes[0], bytes[1]]);
    let device_id = std::str::from_utf8(&bytes[PORT_FIELD_LEN..])
        .map_err(|_| ProtoError::InvalidDeviceIdUtf8)?
        .to_string();
    Ok(RegistrationFrame { port, device_id })
}

/// Encodes a registration frame body, including the `0x0A` terminator.
/// Used by tests and device simulators to drive the registration listener.
pub fn encode_registration_frame(frame: &RegistrationFrame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PORT_FIELD_LEN + frame.device_id.len() + 1);
    bytes.extend_from_slice(&frame.port.to_be_bytes());
    bytes.extend_from_slice(frame.device_id.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Encodes the 2-byte big-endian keepalive-port acknowledgement sent back to
/// a registering device.
pub fn encode_registration_response(keepalive_udp_port: u16) -> [u8; 2] {
    keepalive_udp_port.to_be_bytes()
}

/// Decodes the registration acknowledgement a device reads back.
pub fn decode_registration_response(bytes: &[u8]) -> Result<u16, ProtoError> {
    if bytes.len() != 2 {
        return Err(ProtoError::BadRegistrationResponseLen(bytes.len()));
    }
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(feature = "tokio")]
/// Reads one registration frame from an async stream: bytes up to and
/// including the first `0x0A`, then parses everything before it.
///
/// Only the bytes up to the terminator are consumed; any trailing bytes sent
/// by a misbehaving peer on the same connection are left unread, matching
/// the "further bytes are ignored" rule in the registration listener spec.
pub async fn read_registration_frame_async<R>(
    reader: &mut R,
) -> Result<RegistrationFrame, ProtoError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    let mut byte = [0_u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtoError::UnterminatedFrame);
        }
        if byte[0] == b'\n' {
            break;
        }
        if buf.len() >= MAX_REGISTRATION_FRAME_LEN {
            return Err(ProtoError::RegistrationFrameTooLong(
                MAX_REGISTRATION_FRAME_LEN,
            ));
        }
        buf.push(byte[0]);
    }
    parse_registration_frame(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_happy_registration_frame() {
        let mut bytes = vec![0xEA, 0x60];
        bytes.extend_from_slice(b"some_device");
        let frame = parse_registration_frame(&bytes).unwrap();
        assert_eq!(frame.port, 60_000);
        assert_eq!(frame.device_id, "some_device");
    }

    #[test]
    fn round_trips_through_encode() {
        let frame = RegistrationFrame { port: 256, device_id: "dev".to_string() };
        let mut encoded = encode_registration_frame(&frame);
        assert_eq!(encoded.pop(), Some(b'\n'));
        assert_eq!(parse_registration_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn rejects_frame_shorter_than_port_field() {
        assert_eq!(
            parse_registration_frame(&[0x01]),
            Err(ProtoError::RegistrationFrameTooShort)
        );
    }

    #[test]
    fn rejects_non_utf8_device_id() {
        let bytes = [0x00, 0x01, 0xFF, 0xFE];
        assert_eq!(
            parse_registration_frame(&bytes),
            Err(ProtoError::InvalidDeviceIdUtf8)
        );
    }

    #[test]
    fn response_round_trips() {
        let encoded = encode_registration_response(50_001);
        assert_eq!(decode_registration_response(&encoded).unwrap(), 50_001);
    }

    #[test]
    fn response_rejects_wrong_length() {
        assert_eq!(
            decode_registration_response(&[0x01]),
            Err(ProtoError::BadRegistrationResponseLen(1))
        );
    }
}
