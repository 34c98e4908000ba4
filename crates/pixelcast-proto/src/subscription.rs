use crate::ProtoError;

/// A parsed monitor subscription command: `"<verb> <arg>\n"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `conn <udp_port>` — register/refresh a monitor, giving its
    /// keepalive-target UDP port.
    Conn(u16),
    /// `sub <stream_id>` — subscribe the peer to a stream.
    Sub(String),
    /// `unsub <stream_id>` — unsubscribe the peer from a stream.
    Unsub(String),
}

/// A monitor command response: `acc:<info>` or `err:<info>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Acc(String),
    Err(String),
}

/// Parses one line of the form `"<verb> <arg>"` (the trailing `\n` must
/// already be stripped by the caller).
pub fn parse_command(line: &str) -> Result<Command, ProtoError> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(2, ' ');
    let verb = parts.next().filter(|v| !v.is_empty()).ok_or(ProtoError::UnrecognizedVerb)?;
    let arg = parts.next().ok_or(ProtoError::MissingArgument)?;

    match verb {
        "conn" => {
            let port: u16 = arg.trim().parse().map_err(|_| ProtoError::PortNotAnInt)?;
            Ok(Command::Conn(port))
        }
        "sub" => Ok(Command::Sub(arg.trim().to_string())),
        "unsub" => Ok(Command::Unsub(arg.trim().to_string())),
        _ => Err(ProtoError::UnrecognizedVerb),
    }
}

/// Encodes a command for test drivers / monitor simulators.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let line = match command {
        Command::Conn(port) => format!("conn {port}\n"),
        Command::Sub(stream_id) => format!("sub {stream_id}\n"),
        Command::Unsub(stream_id) => format!("unsub {stream_id}\n"),
    };
    line.into_bytes()
}

/// Encodes a response. Both tags share this single code path so `acc` and
/// `err` can never drift apart on the `:` separator.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let (tag, info) = match response {
        Response::Acc(info) => ("acc", info.as_str()),
        Response::Err(info) => ("err", info.as_str()),
    };
    format!("{tag}:{info}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_conn_command() {
        assert_eq!(parse_command("conn 54321"), Ok(Command::Conn(54_321)));
    }

    #[test]
    fn parses_sub_and_unsub() {
        assert_eq!(parse_command("sub fft"), Ok(Command::Sub("fft".to_string())));
        assert_eq!(parse_command("unsub fft"), Ok(Command::Unsub("fft".to_string())));
    }

    #[test]
    fn tolerates_trailing_newline() {
        assert_eq!(parse_command("conn 1\n"), Ok(Command::Conn(1)));
        assert_eq!(parse_command("conn 1\r\n"), Ok(Command::Conn(1)));
    }

    #[test]
    fn rejects_unknown_verb() {
        assert_eq!(parse_command("ping 1"), Err(ProtoError::UnrecognizedVerb));
    }

    #[test]
    fn rejects_non_integer_conn_port() {
        assert_eq!(parse_command("conn abc"), Err(ProtoError::PortNotAnInt));
    }

    #[test]
    fn rejects_missing_argument() {
        assert_eq!(parse_command("conn"), Err(ProtoError::MissingArgument));
    }

    #[test]
    fn encodes_acc_and_err_uniformly() {
        assert_eq!(
            encode_response(&Response::Acc("acc".to_string())),
            b"acc:acc"
        );
        assert_eq!(
            encode_response(&Response::Err("unrecognized command verb".to_string())),
            b"err:unrecognized command verb"
        );
    }

    #[test]
    fn command_round_trips_through_encode() {
        for command in [
            Command::Conn(54_321),
            Command::Sub("fft".to_string()),
            Command::Unsub("fft".to_string()),
        ] {
            let encoded = encode_command(&command);
            let line = std::str::from_utf8(&encoded).unwrap();
            assert_eq!(parse_command(line), Ok(command));
        }
    }
}
