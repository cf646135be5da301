/*!
 * Frame codecs for hardware links.
 *
 * A codec turns outbound commands into bytes and inbound bytes into
 * [`Inbound`] events. Replies carry the digest of the request they answer,
 * which is how the link loop correlates them.
 */
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::{Buf, Bytes, BytesMut};

use homeflow_core::types::{Address, Command};

use crate::device::{DeviceError, Result};

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The hardware address the message concerns
    pub address: Address,
    /// The decoded command
    pub command: Command,
    /// Digest of the request this message answers, if it is a reply
    pub reply_to: Option<u64>,
}

impl Inbound {
    /// An unsolicited event
    pub fn event(address: Address, command: Command) -> Self {
        Self {
            address,
            command,
            reply_to: None,
        }
    }
}

/// Content hash used to pair replies with requests
pub fn request_digest(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Encodes and decodes the frames of one link family
pub trait Codec: Send + 'static {
    /// Encode a command for an address
    fn encode(&self, address: &Address, command: Command) -> Result<Bytes>;

    /// Decode the next frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. On error the codec
    /// must have consumed the offending frame.
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Inbound>>;

    /// Whether the hardware acknowledges this command
    fn expects_reply(&self, _command: Command) -> bool {
        true
    }
}

/// A plain ASCII line protocol.
///
/// Requests and events are `<ADDRESS> <COMMAND>\n`; acknowledgements are
/// `OK <ADDRESS> <COMMAND>\n` echoing the request.
#[derive(Debug, Clone)]
pub struct LineCodec {
    acknowledged: bool,
    max_line: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self {
            acknowledged: true,
            max_line: 256,
        }
    }
}

impl LineCodec {
    /// Create a codec expecting acknowledgements
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the hardware acknowledges commands
    pub fn with_acknowledgements(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    fn parse_line(&self, line: &str) -> Result<Inbound> {
        let mut words = line.split_whitespace();
        let first = words
            .next()
            .ok_or_else(|| DeviceError::malformed("empty line"))?;

        let (is_reply, address) = if first.eq_ignore_ascii_case("OK") {
            let address = words
                .next()
                .ok_or_else(|| DeviceError::malformed(format!("reply without address: {}", line)))?;
            (true, address)
        } else {
            (false, first)
        };

        let rest: Vec<&str> = words.collect();
        if rest.is_empty() {
            return Err(DeviceError::malformed(format!("missing command: {}", line)));
        }
        let command: Command = rest
            .join(" ")
            .parse()
            .map_err(|e| DeviceError::malformed(format!("{}: {}", line, e)))?;
        let address = Address::new(address);

        let reply_to = if is_reply {
            Some(request_digest(&self.encode(&address, command)?))
        } else {
            None
        };
        Ok(Inbound {
            address,
            command,
            reply_to,
        })
    }
}

impl Codec for LineCodec {
    fn encode(&self, address: &Address, command: Command) -> Result<Bytes> {
        if address.as_str().is_empty() || address.as_str().contains(char::is_whitespace) {
            return Err(DeviceError::configuration(format!(
                "Address {:?} cannot be framed",
                address.as_str()
            )));
        }
        Ok(Bytes::from(format!("{} {}\n", address, command)))
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Inbound>> {
        loop {
            let newline = match buf.iter().position(|b| *b == b'\n') {
                Some(at) => at,
                None if buf.len() > self.max_line => {
                    let len = buf.len();
                    buf.advance(len);
                    return Err(DeviceError::malformed(format!("line exceeds {} bytes", self.max_line)));
                }
                None => return Ok(None),
            };

            let frame = buf.split_to(newline + 1);
            let line = std::str::from_utf8(&frame[..newline])
                .map_err(|_| DeviceError::malformed("line is not valid UTF-8"))?
                .trim();
            if line.is_empty() {
                continue;
            }
            return self.parse_line(line).map(Some);
        }
    }

    fn expects_reply(&self, _command: Command) -> bool {
        self.acknowledged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let codec = LineCodec::new();
        let bytes = codec.encode(&Address::new("a1"), Command::Level(30)).unwrap();
        assert_eq!(&bytes[..], b"A1 LEVEL:30\n");
        assert!(codec.encode(&Address::new(""), Command::On).is_err());
    }

    #[test]
    fn test_decode_events_and_partial_frames() {
        let codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"a1 motion\r\n\nB2 LEVEL 20\nC3 O"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Inbound::event(Address::new("A1"), Command::Motion));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.command, Command::Level(20));

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"C3 O");
    }

    #[test]
    fn test_reply_digest_matches_request() {
        let codec = LineCodec::new();
        let request = codec.encode(&Address::new("A1"), Command::On).unwrap();

        let mut buf = BytesMut::from(&b"OK a1 on\n"[..]);
        let reply = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.reply_to, Some(request_digest(&request)));
    }

    #[test]
    fn test_malformed_frame_is_consumed() {
        let codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"A1 DANCE\nA1 ON\n"[..]);

        assert!(matches!(codec.decode(&mut buf), Err(DeviceError::MalformedFrame(_))));
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.command, Command::On);
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let codec = LineCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; 300].as_slice());
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
