use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::AbyssError;

/// Registered request heads on the admin control socket.
pub mod head {
    pub const HELLO: u16 = 100;
    pub const INIT: u16 = 103;
    pub const USERADD: u16 = 104;
    pub const INCLUDE: u16 = 105;
    pub const CHMOD: u16 = 106;
    pub const LIST: u16 = 107;
}

/// Response heads reuse HTTP-style codes.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL: u16 = 500;
}

/// One message on the control socket, in either direction.
///
/// Wire form is a single line: `base64(json({head, params}))` + `\n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtlMessage {
    pub head: u16,
    pub params: Vec<String>,
}

impl CtlMessage {
    pub fn new(head: u16, params: Vec<String>) -> Self {
        Self { head, params }
    }

    pub fn ok(params: Vec<String>) -> Self {
        Self::new(status::OK, params)
    }

    pub fn error(head: u16, message: impl Into<String>) -> Self {
        Self::new(head, vec![message.into()])
    }

    /// Encode to the wire form, newline not included.
    pub fn encode(&self) -> Result<String, AbyssError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| AbyssError::Malformed(format!("ctl json: {e}")))?;
        Ok(BASE64.encode(json))
    }

    /// Decode one received line (trailing newline tolerated).
    pub fn decode(line: &str) -> Result<Self, AbyssError> {
        let raw = BASE64
            .decode(line.trim_end())
            .map_err(|e| AbyssError::Malformed(format!("ctl base64: {e}")))?;
        serde_json::from_slice(&raw).map_err(|e| AbyssError::Malformed(format!("ctl json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let msg = CtlMessage::new(head::USERADD, vec!["alice".into(), "10".into()]);
        let decoded = CtlMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn trailing_newline_tolerated() {
        let msg = CtlMessage::new(head::HELLO, vec![]);
        let line = format!("{}\n", msg.encode().unwrap());
        assert_eq!(CtlMessage::decode(&line).unwrap(), msg);
    }

    #[test]
    fn garbage_rejected() {
        assert!(CtlMessage::decode("not-base64!!").is_err());
        // Valid base64, invalid JSON inside.
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        let bogus = BASE64.encode(b"{\"nope\":true}");
        assert!(CtlMessage::decode(&bogus).is_err());
    }
}
