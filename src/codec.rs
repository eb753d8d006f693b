use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Lines longer than this are cut; the remainder up to the next line feed is discarded.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Splits the serial byte stream into text lines and terminates outbound lines with CRLF.
///
/// The device mixes CRLF and bare LF line ends and occasionally emits bytes that are not
/// valid UTF-8 (e.g. garbage after a reset), so decoding is lossy and never fails.
#[derive(Default)]
pub struct LineCodec {
    discarding: bool,
}

fn to_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            match src.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    let line = src.split_to(end + 1);
                    if std::mem::take(&mut self.discarding) {
                        continue;
                    }
                    return Ok(Some(to_text(&line[..end])));
                }
                None if src.len() > MAX_LINE_LENGTH => {
                    if self.discarding {
                        src.clear();
                        return Ok(None);
                    }
                    trace!(message = "truncating an overlong line", buffered = src.len());
                    let head = src.split_to(MAX_LINE_LENGTH);
                    self.discarding = true;
                    return Ok(Some(to_text(&head)));
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() || std::mem::take(&mut self.discarding) {
            src.clear();
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(to_text(&rest)))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 2);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\r\n");
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}
