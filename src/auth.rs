//! `Authenticator`: the line-based `AUTH EXTERNAL` handshake run over a
//! freshly opened transport before any binary messages are sent.
//!
//! The sequence: a leading NUL byte, `AUTH EXTERNAL <hex(ascii(uid))>\r\n`,
//! an expected `OK <guid>\r\n` reply, `NEGOTIATE_UNIX_FD\r\n`, an expected
//! `AGREE_UNIX_FD\r\n` reply, then `BEGIN\r\n` to switch the transport
//! over to the binary message protocol. Any unrecognized line fails the
//! handshake.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Initial,
    ExpectOk,
    ExpectUnixFdResponse,
    Authenticated,
    Failed,
}

pub struct Authenticator {
    state: AuthState,
    buf: Vec<u8>,
    server_guid: Option<String>,
}

impl Authenticator {
    pub fn new() -> Self {
        Authenticator { state: AuthState::Initial, buf: Vec::new(), server_guid: None }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, AuthState::Authenticated | AuthState::Failed)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn server_guid(&self) -> Option<&str> {
        self.server_guid.as_deref()
    }

    /// Produce the bytes that open the handshake: the credential-passing
    /// NUL byte followed by the `AUTH EXTERNAL` line.
    pub fn start(&mut self, uid: u32) -> Vec<u8> {
        let mut out = vec![0u8];
        out.extend_from_slice(format!("AUTH EXTERNAL {}\r\n", hex_encode_ascii(&uid.to_string())).as_bytes());
        self.state = AuthState::ExpectOk;
        out
    }

    /// Feed newly received bytes; returns the bytes that should be
    /// written back in response, if any. Each complete `\r\n`-terminated
    /// line advances the state machine; `Err(AuthenticationFailed)` means
    /// the handshake cannot continue and the transport should be closed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while !self.is_finished() {
            let Some(pos) = find_crlf(&self.buf) else { break };
            let line = self.buf.drain(..pos + 2).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
            self.advance(&line, &mut out)?;
        }
        Ok(out)
    }

    fn advance(&mut self, line: &str, out: &mut Vec<u8>) -> Result<()> {
        match self.state {
            AuthState::ExpectOk => {
                if let Some(guid) = line.strip_prefix("OK ") {
                    self.server_guid = Some(guid.to_string());
                    out.extend_from_slice(b"NEGOTIATE_UNIX_FD\r\n");
                    self.state = AuthState::ExpectUnixFdResponse;
                    log::debug!("auth: got OK, negotiating unix fd passing");
                    Ok(())
                } else {
                    self.state = AuthState::Failed;
                    log::warn!("auth: expected OK, got {:?}", line);
                    Err(Error::AuthenticationFailed)
                }
            }
            AuthState::ExpectUnixFdResponse => {
                if line.starts_with("AGREE_UNIX_FD") {
                    out.extend_from_slice(b"BEGIN\r\n");
                    self.state = AuthState::Authenticated;
                    log::debug!("auth: handshake complete");
                    Ok(())
                } else {
                    self.state = AuthState::Failed;
                    log::warn!("auth: expected AGREE_UNIX_FD, got {:?}", line);
                    Err(Error::AuthenticationFailed)
                }
            }
            AuthState::Initial | AuthState::Authenticated | AuthState::Failed => {
                self.state = AuthState::Failed;
                Err(Error::AuthenticationFailed)
            }
        }
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// The bus expects the uid as ascii digits, hex-encoded byte by byte —
/// not the hex of the raw uid integer.
fn hex_encode_ascii(s: &str) -> String {
    s.bytes().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_succeeds() {
        let mut auth = Authenticator::new();
        let start = auth.start(1000);
        assert_eq!(start[0], 0);
        assert!(String::from_utf8_lossy(&start[1..]).starts_with("AUTH EXTERNAL "));
        assert_eq!(auth.state(), AuthState::ExpectOk);

        let reply1 = auth.feed(b"OK 1234deadbeef1234deadbeef1234de\r\n").unwrap();
        assert_eq!(reply1, b"NEGOTIATE_UNIX_FD\r\n");
        assert_eq!(auth.server_guid(), Some("1234deadbeef1234deadbeef1234de"));
        assert_eq!(auth.state(), AuthState::ExpectUnixFdResponse);

        let reply2 = auth.feed(b"AGREE_UNIX_FD\r\n").unwrap();
        assert_eq!(reply2, b"BEGIN\r\n");
        assert!(auth.is_authenticated());
        assert!(auth.is_finished());
    }

    #[test]
    fn unrecognized_reply_fails() {
        let mut auth = Authenticator::new();
        auth.start(1000);
        let err = auth.feed(b"REJECTED EXTERNAL\r\n").unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed));
        assert!(auth.is_finished());
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn partial_line_waits_for_more_bytes() {
        let mut auth = Authenticator::new();
        auth.start(1000);
        let out = auth.feed(b"OK somefakeguid").unwrap();
        assert!(out.is_empty());
        assert_eq!(auth.state(), AuthState::ExpectOk);
        let out = auth.feed(b"\r\n").unwrap();
        assert_eq!(out, b"NEGOTIATE_UNIX_FD\r\n");
    }

    #[test]
    fn hex_encoding_matches_ascii_digits() {
        assert_eq!(hex_encode_ascii("1000"), "31303030");
    }
}
