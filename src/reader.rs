//! Framing reader for the raw analyzer stream.
//!
//! The wire format is a sequence of frames, each a big-endian `u16`
//! length followed by that many bytes of packet content. The stream
//! ends at EOF; a partial length or partial payload is treated exactly
//! like a clean end of stream.

use std::io::{ErrorKind, Read};
use std::time::Instant;

/// Largest frame the wire format can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Pulls length-prefixed frames from a byte source, stamping each with
/// a monotonic nanosecond timestamp taken once its length is read.
///
/// The sequence is lazy, finite and non-restartable; one internal
/// buffer is reused for every frame.
pub struct FrameReader<R> {
    source: R,
    buffer: Box<[u8]>,
    origin: Instant,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R) -> FrameReader<R> {
        FrameReader {
            source,
            buffer: vec![0; MAX_FRAME_SIZE].into_boxed_slice(),
            origin: Instant::now(),
        }
    }

    /// Read the next frame, or `None` at (possibly truncated) end of
    /// stream. The returned slice is valid until the next call.
    pub fn next_frame(&mut self) -> std::io::Result<Option<(u64, &[u8])>> {
        let mut length_bytes = [0u8; 2];
        if !read_full(&mut self.source, &mut length_bytes)? {
            return Ok(None);
        }
        let timestamp_ns = self.origin.elapsed().as_nanos() as u64;
        let length = u16::from_be_bytes(length_bytes) as usize;
        if !read_full(&mut self.source, &mut self.buffer[..length])? {
            return Ok(None);
        }
        Ok(Some((timestamp_ns, &self.buffer[..length])))
    }
}

/// Fill `buf` completely. Returns false if the source ran out first;
/// interrupted reads are retried, other I/O errors propagate.
fn read_full<R: Read>(source: &mut R, mut buf: &mut [u8]) -> std::io::Result<bool> {
    while !buf.is_empty() {
        match source.read(buf) {
            Ok(0) => return Ok(false),
            Ok(n) => buf = &mut buf[n..],
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_split_on_length_prefixes() {
        let input: &[u8] = &[0, 1, 0xD2, 0, 3, 0xE1, 0x01, 0x02];
        let mut reader = FrameReader::new(input);

        let (_, frame) = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame, &[0xD2]);
        let (_, frame) = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame, &[0xE1, 0x01, 0x02]);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn empty_input_ends_immediately() {
        let input: &[u8] = &[];
        let mut reader = FrameReader::new(input);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn partial_length_is_end_of_stream() {
        let input: &[u8] = &[0];
        let mut reader = FrameReader::new(input);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn partial_payload_is_end_of_stream() {
        // Length says 3, only 2 bytes follow.
        let input: &[u8] = &[0, 3, 0xE1, 0x01];
        let mut reader = FrameReader::new(input);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn zero_length_frames_are_yielded() {
        let input: &[u8] = &[0, 0, 0, 1, 0xD2];
        let mut reader = FrameReader::new(input);

        let (_, frame) = reader.next_frame().unwrap().unwrap();
        assert!(frame.is_empty());
        let (_, frame) = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame, &[0xD2]);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let input: &[u8] = &[0, 1, 0xA5, 0, 1, 0xA5];
        let mut reader = FrameReader::new(input);

        let (first, _) = reader.next_frame().unwrap().unwrap();
        let (second, _) = reader.next_frame().unwrap().unwrap();
        assert!(second >= first);
    }
}
