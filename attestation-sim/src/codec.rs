//! Stream framing for the device protocol.
//!
//! Commands are newline-terminated lines; responses carry a status byte and a
//! big-endian length prefix. [`DeviceCodec`] is the device end of the stream,
//! [`HostCodec`] the host end.

use crate::protocol::{
    parse_command, Command, ProtocolError, Response, Status, MAX_PAYLOAD_BYTES,
    RESPONSE_HEADER_BYTES,
};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Device side: decodes command lines, encodes response frames.
///
/// A malformed line decodes to `Err(ProtocolError)` as an item rather than as
/// a stream error, so the session can answer it and keep going.
#[derive(Debug)]
pub struct DeviceCodec {
    max_line_bytes: usize,
    discarding: bool,
}

impl DeviceCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            discarding: false,
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

impl Decoder for DeviceCodec {
    type Item = Result<Command, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        loop {
            let newline = src.iter().position(|b| *b == b'\n');

            if self.discarding {
                match newline {
                    Some(end) => {
                        src.advance(end + 1);
                        self.discarding = false;
                        return Ok(Some(Err(ProtocolError::LineTooLong(self.max_line_bytes))));
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(end) = newline else {
                if src.len() > self.max_line_bytes {
                    self.discarding = true;
                    src.clear();
                }
                return Ok(None);
            };

            let line = src.split_to(end + 1);
            let line = line[..end].strip_suffix(b"\r").unwrap_or(&line[..end]);
            if line.len() > self.max_line_bytes {
                return Ok(Some(Err(ProtocolError::LineTooLong(self.max_line_bytes))));
            }
            if is_blank(line) {
                continue;
            }
            return Ok(Some(parse_command(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if self.discarding {
            self.discarding = false;
            return Ok(Some(Err(ProtocolError::LineTooLong(self.max_line_bytes))));
        }

        // A final command without a terminator is still a command.
        let rest = src.split();
        if is_blank(&rest) {
            return Ok(None);
        }
        Ok(Some(parse_command(&rest)))
    }
}

impl Encoder<Response> for DeviceCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), io::Error> {
        if item.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response payload too large",
            ));
        }
        dst.reserve(RESPONSE_HEADER_BYTES + item.payload.len());
        dst.put_u8(item.status as u8);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Host side: encodes commands as lines, decodes response frames.
#[derive(Debug, Default)]
pub struct HostCodec;

impl Encoder<Command> for HostCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), io::Error> {
        let line = item.to_string();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl Decoder for HostCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, io::Error> {
        if src.len() < RESPONSE_HEADER_BYTES {
            return Ok(None);
        }

        let status = Status::from_byte(src[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown response status: {:#04x}", src[0]),
            )
        })?;
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > MAX_PAYLOAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response payload of {} bytes exceeds limit", length),
            ));
        }

        if src.len() < RESPONSE_HEADER_BYTES + length {
            src.reserve(RESPONSE_HEADER_BYTES + length - src.len());
            return Ok(None);
        }

        src.advance(RESPONSE_HEADER_BYTES);
        let payload = src.split_to(length).to_vec();
        Ok(Some(Response { status, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attestation_core::Mutation;

    #[test]
    fn test_crlf_does_not_count_toward_limit() {
        let line = format!("C{}", "ab".repeat(32));
        let mut codec = DeviceCodec::new(line.len());

        let mut buf = BytesMut::from(format!("{}\r\n", line).as_bytes());
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Ok(Command::Challenge(_)))
        ));

        let mut buf = BytesMut::from(format!("{}0\n", line).as_bytes());
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Err(ProtocolError::LineTooLong(65)))
        );
    }

    #[test]
    fn test_decodes_lines_one_at_a_time() {
        let mut codec = DeviceCodec::new(256);
        let mut buf = BytesMut::from(&b"H\r\nMboot\nV"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ok(Command::Checkpoint)));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Ok(Command::Mutate {
                kind: Mutation::Boot,
                value: None
            }))
        );
        // Incomplete until the newline arrives.
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ok(Command::Verify)));
    }

    #[test]
    fn test_skips_blank_lines_and_reports_bad_ones() {
        let mut codec = DeviceCodec::new(256);
        let mut buf = BytesMut::from(&b"\n\r\nQ\nI\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Err(ProtocolError::UnknownTag('Q')))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ok(Command::Identity)));
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut codec = DeviceCodec::new(8);
        let mut buf = BytesMut::from(&b"MMMMMMMMMMMM"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"MMMM\nH\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Err(ProtocolError::LineTooLong(8)))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ok(Command::Checkpoint)));
    }

    #[test]
    fn test_unterminated_command_at_eof() {
        let mut codec = DeviceCodec::new(256);
        let mut buf = BytesMut::from(&b"V"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Ok(Command::Verify)));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_response_frame_layout() {
        let mut buf = BytesMut::new();
        DeviceCodec::new(256)
            .encode(Response::ok(vec![0xaa, 0xbb]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x00, 0, 0, 0, 2, 0xaa, 0xbb]);

        let mut host = HostCodec;
        let mut partial = buf.split_to(6);
        assert_eq!(host.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert_eq!(
            host.decode(&mut partial).unwrap(),
            Some(Response::ok(vec![0xaa, 0xbb]))
        );
    }

    #[test]
    fn test_host_rejects_unknown_status() {
        let mut buf = BytesMut::from(&[0x42, 0, 0, 0, 0][..]);
        assert!(HostCodec.decode(&mut buf).is_err());
    }
}
