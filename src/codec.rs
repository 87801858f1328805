use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

// Upper bound on buffered bytes without a line break
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024;

// Codec for the Blackmagic text protocol.
//
// Decoding yields every complete line currently buffered as one batch, blank
// lines included, since blank lines terminate sections. A trailing partial
// line stays buffered until its newline arrives. Encoding writes command text
// as-is; commands carry their own terminators.
#[derive(Debug, Clone)]
pub struct LineBatchCodec {
    max_buffered: usize,
}

impl LineBatchCodec {
    pub fn new() -> Self {
        Self {
            max_buffered: DEFAULT_MAX_BUFFERED,
        }
    }

    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self { max_buffered }
    }
}

impl Default for LineBatchCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn split_lines(chunk: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(chunk)
        .split_terminator('\n')
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

impl Decoder for LineBatchCodec {
    type Item = Vec<String>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(last) = src.iter().rposition(|b| *b == b'\n') else {
            if src.len() > self.max_buffered {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no line break within {} bytes", self.max_buffered),
                ));
            }
            return Ok(None);
        };
        let chunk = src.split_to(last + 1);
        Ok(Some(split_lines(&chunk)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(batch) = self.decode(src)? {
            return Ok(Some(batch));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(split_lines(&rest)))
    }
}

impl Encoder<String> for LineBatchCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}
