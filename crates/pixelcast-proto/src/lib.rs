//! Wire framing shared between the pixel-device coordination server and its
//! peers: device registration, device keepalive, monitoring packages, and
//! monitor subscription control.
//!
//! Every parser here is pure and allocation-light; the `tokio` feature adds
//! an async helper for reading a newline-terminated registration frame off a
//! `TcpStream` without duplicating the parsing logic.

mod keepalive;
mod package;
mod registration;
mod subscription;

pub use keepalive::{DeviceKeepalive, parse_device_keepalive};
pub use package::{Package, encode_package, parse_package};
pub use registration::{
    RegistrationFrame, decode_registration_response, encode_registration_frame,
    encode_registration_response,
};
pub use subscription::{Command, Response, encode_command, encode_response, parse_command};

#[cfg(feature = "tokio")]
pub use registration::read_registration_frame_async;

use thiserror::Error;

/// Errors raised while decoding a frame from any of the wire protocols.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("registration frame is shorter than the 2-byte port field")]
    RegistrationFrameTooShort,
    #[error("registration response must be exactly 2 bytes, got {0}")]
    BadRegistrationResponseLen(usize),
    #[error("device_id is not valid UTF-8")]
    InvalidDeviceIdUtf8,
    #[error("keepalive text is not valid UTF-8")]
    InvalidKeepaliveUtf8,
    #[error("keepalive must be \"<frames> <rendered>\", got {0:?}")]
    MalformedKeepalive(String),
    #[error("monitoring package has an empty stream_id")]
    EmptyStreamId,
    #[error("monitoring package is missing the 0x00 stream_id terminator")]
    MissingStreamIdTerminator,
    #[error("monitoring package stream_id is not valid UTF-8")]
    InvalidStreamIdUtf8,
    #[error("subscription command is not valid UTF-8")]
    InvalidCommandUtf8,
    #[error("unrecognized command verb")]
    UnrecognizedVerb,
    #[error("port needs to be an int")]
    PortNotAnInt,
    #[error("command is missing its argument")]
    MissingArgument,
    #[cfg(feature = "tokio")]
    #[error("registration frame never terminated before connection closed")]
    UnterminatedFrame,
    #[cfg(feature = "tokio")]
    #[error("registration frame exceeds the {0}-byte limit")]
    RegistrationFrameTooLong(usize),
    #[cfg(feature = "tokio")]
    #[error("io error: {0}")]
    Io(String),
}

#[cfg(feature = "tokio")]
impl From<std::io::Error> for ProtoError {
    fn from(err: std::io::Error) -> Self {
        ProtoError::Io(err.to_string())
    }
}
