// Frame codec for the sender -> receiver stream: concatenated JSON objects, no length prefix.
// Bytes are buffered until a whole object parses. A parse that runs out of input means the
// frame is incomplete and we keep buffering. Any other parse error discards the bad frame alone,
// through its closing brace, so frames queued behind it still decode.

use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::models::WireMessage;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid magic (found {found:?})")]
    BadMagic { found: Option<i64> },
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("frame does not match message schema: {0}")]
    Schema(serde_json::Error),
    #[error("incomplete frame of {len} bytes exceeds limit of {limit} bytes")]
    Oversized { len: usize, limit: usize },
}

#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    magic: i64,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(magic: i64, max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            magic,
            max_frame_bytes,
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame. `Ok(None)` means more bytes are needed. After an `Err` the offending
    /// bytes are gone and the caller should keep calling `decode` for any frames behind them.
    pub fn decode(&mut self) -> Result<Option<WireMessage>, CodecError> {
        let leading_ws = self
            .buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buf.advance(leading_ws);
        if self.buf.is_empty() {
            return Ok(None);
        }

        let parsed = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => Ok(Some((value, stream.byte_offset()))),
                Some(Err(e)) if e.is_eof() => Ok(None),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        };

        match parsed {
            Ok(Some((value, consumed))) => {
                self.buf.advance(consumed);
                self.accept(value).map(Some)
            }
            Ok(None) => {
                if self.buf.len() > self.max_frame_bytes {
                    let len = self.buf.len();
                    self.buf.clear();
                    return Err(CodecError::Oversized {
                        len,
                        limit: self.max_frame_bytes,
                    });
                }
                Ok(None)
            }
            Err(e) => {
                let skip = bad_frame_len(&self.buf);
                self.buf.advance(skip);
                Err(CodecError::Malformed(e))
            }
        }
    }

    fn accept(&self, value: Value) -> Result<WireMessage, CodecError> {
        let found = value.get("magic").and_then(Value::as_i64);
        if found != Some(self.magic) {
            return Err(CodecError::BadMagic { found });
        }
        serde_json::from_value(value).map_err(CodecError::Schema)
    }
}

/// Bytes to drop for a frame that failed to parse: through the brace closing the first top-level
/// object, or up to the next `{` when the buffer does not start with a closed object.
fn bad_frame_len(buf: &[u8]) -> usize {
    let next_open = |from: usize| {
        buf.iter()
            .skip(from)
            .position(|&b| b == b'{')
            .map_or(buf.len(), |i| from + i)
    };
    if buf.first() != Some(&b'{') {
        return next_open(0);
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
    }
    next_open(1)
}

/// Serialize one frame.
pub fn encode(message: &WireMessage) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}
