//! Length-prefixed framing
//!
//! A frame is `[var length][payload]`. The send path writes frames straight
//! into pooled buffers (see `network::sender`); this module holds the
//! standalone encoder and the receive-side reassembly.

use super::varint;
use crate::error::FrameError;

/// Frame a single payload into a fresh vector.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint::encoded_len(payload.len() as u32) + payload.len());
    varint::write_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

/// Streaming frame reassembly.
///
/// Packets may cut frames (and their length prefixes) at any byte; bytes are
/// accumulated until a whole frame is present.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            read_pos: 0,
            max_frame_len,
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        // Compact consumed bytes before growing
        if self.read_pos > 0 {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame payload, if any.
    ///
    /// After an error the stream cannot be resynchronized; call [`reset`].
    ///
    /// [`reset`]: FrameDecoder::reset
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>, FrameError> {
        let pending = &self.buffer[self.read_pos..];
        let (len, prefix) = match varint::read_u32(pending) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(None),
            Err(_) => return Err(FrameError::CorruptPrefix),
        };
        let len = len as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if pending.len() < prefix + len {
            return Ok(None);
        }
        let start = self.read_pos + prefix;
        self.read_pos = start + len;
        Ok(Some(&self.buffer[start..start + len]))
    }

    /// Bytes received but not yet returned as frames.
    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

/// Iterator over the frames of one contiguous byte slice.
pub struct FrameIter<'a> {
    buffer: &'a [u8],
    read_pos: usize,
}

impl<'a> FrameIter<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            read_pos: 0,
        }
    }

    /// Bytes after the last complete frame. Zero once a corrupt prefix has
    /// been reported.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.read_pos)
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<&'a [u8], FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let buffer = self.buffer;
        let pending = &buffer[self.read_pos..];
        let (len, prefix) = match varint::read_u32(pending) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return None,
            Err(_) => {
                // Nothing after a corrupt prefix can be framed
                self.read_pos = buffer.len();
                return Some(Err(FrameError::CorruptPrefix));
            }
        };
        let end = prefix + len as usize;
        if pending.len() < end {
            return None;
        }
        self.read_pos += end;
        Some(Ok(&pending[prefix..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_single() {
        let frame = encode_frame(b"Hello, peer!");
        assert_eq!(frame[0], 12);

        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&frame);
        assert_eq!(decoder.next_frame().unwrap(), Some(&b"Hello, peer!"[..]));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_reassembly_byte_by_byte() {
        let payload = vec![7u8; 300];
        let mut stream = encode_frame(&payload);
        stream.extend(encode_frame(b""));
        stream.extend(encode_frame(b"tail"));

        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for byte in stream {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame.to_vec());
            }
        }
        assert_eq!(frames, vec![payload, Vec::new(), b"tail".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&encode_frame(&[0u8; 17]));
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { len: 17, max: 16 })
        );
        decoder.reset();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_iter() {
        let mut stream = encode_frame(b"one");
        stream.extend(encode_frame(b"two"));
        stream.push(9); // truncated third frame

        let mut iter = FrameIter::new(&stream);
        let frames: Vec<_> = iter.by_ref().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![&b"one"[..], &b"two"[..]]);
        assert_eq!(iter.remaining(), 1);
    }

    #[test]
    fn test_frame_iter_stops_after_corrupt_prefix() {
        let mut stream = encode_frame(b"ok");
        stream.extend([0xFF; 6]);

        let items: Vec<_> = FrameIter::new(&stream).take(100).collect();
        assert_eq!(items, vec![Ok(&b"ok"[..]), Err(FrameError::CorruptPrefix)]);

        let mut iter = FrameIter::new(&[0xFF; 6]);
        assert_eq!(iter.by_ref().take(1000).filter(|f| f.is_err()).count(), 1);
        assert_eq!(iter.remaining(), 0);
        assert_eq!(FrameIter::new(&stream).flatten().count(), 1);
    }
}
