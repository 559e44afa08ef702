//! Incremental JPEG framer for transcoder pipe output
//!
//! The transcoder writes a stream of concatenated JPEG images to its stdout.
//! Frames arrive split across arbitrary read boundaries, so the framer
//! buffers input and scans for start-of-image / end-of-image markers,
//! yielding each complete frame as its own owned buffer.

use bytes::{Buf, Bytes, BytesMut};

/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Largest frame accepted before the buffer is considered runaway garbage
const DEFAULT_MAX_FRAME: usize = 5 * 1024 * 1024;

pub struct JpegFramer {
    buf: BytesMut,
    max_frame: usize,
}

impl JpegFramer {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    /// Feed one chunk of pipe output, returning every frame completed by it
    ///
    /// Bytes outside SOI..EOI are discarded. If a frame grows past
    /// `max_frame` without closing, the buffer is dropped and scanning
    /// restarts at the next SOI.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            let Some(soi) = find_marker(&self.buf, &SOI) else {
                // No frame start in sight; keep one byte in case a marker
                // straddles this read and the next.
                let garbage = self.buf.len().saturating_sub(1);
                self.buf.advance(garbage);
                break;
            };

            if soi > 0 {
                self.buf.advance(soi);
            }

            match find_marker(&self.buf[SOI.len()..], &EOI) {
                Some(rel) => {
                    let end = SOI.len() + rel + EOI.len();
                    frames.push(self.buf.split_to(end).freeze());
                }
                None => {
                    if self.buf.len() > self.max_frame {
                        tracing::warn!(
                            buffered = self.buf.len(),
                            "Discarding runaway frame buffer"
                        );
                        self.buf.clear();
                    }
                    break;
                }
            }
        }
        frames
    }

    /// Bytes currently buffered waiting for a frame to complete
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for JpegFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = SOI.to_vec();
        frame.extend_from_slice(body);
        frame.extend_from_slice(&EOI);
        frame
    }

    #[test]
    fn test_single_complete_frame() {
        let mut framer = JpegFramer::new();
        let frame = jpeg(b"abc");

        let out = framer.feed(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut framer = JpegFramer::new();
        let frame = jpeg(&[0x01, 0x02, 0x03, 0x04]);

        assert!(framer.feed(&frame[..3]).is_empty());
        assert!(framer.feed(&frame[3..5]).is_empty());
        let out = framer.feed(&frame[5..]);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn test_marker_split_at_boundary() {
        let mut framer = JpegFramer::new();
        let frame = jpeg(b"x");

        // Split in the middle of the EOI marker itself
        let cut = frame.len() - 1;
        assert!(framer.feed(&frame[..cut]).is_empty());
        let out = framer.feed(&frame[cut..]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_multiple_frames_one_read() {
        let mut framer = JpegFramer::new();
        let mut data = jpeg(b"one");
        data.extend_from_slice(&jpeg(b"two"));

        let out = framer.feed(&data);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[1][..], &jpeg(b"two")[..]);
    }

    #[test]
    fn test_garbage_between_frames_skipped() {
        let mut framer = JpegFramer::new();
        let mut data = b"noise".to_vec();
        data.extend_from_slice(&jpeg(b"payload"));
        data.extend_from_slice(b"trailing");

        let out = framer.feed(&data);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &jpeg(b"payload")[..]);
        // Trailing garbage is dropped down to a single carry-over byte
        assert!(framer.pending() <= 1);
    }

    #[test]
    fn test_runaway_buffer_discarded() {
        let mut framer = JpegFramer::with_max_frame(16);
        let mut data = SOI.to_vec();
        data.extend_from_slice(&[0u8; 64]);

        assert!(framer.feed(&data).is_empty());
        assert_eq!(framer.pending(), 0);

        // Recovers on the next complete frame
        let out = framer.feed(&jpeg(b"ok"));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_frames_are_owned_copies() {
        let mut framer = JpegFramer::new();
        let frame = jpeg(b"copy");
        let out = framer.feed(&frame);

        // Yielded buffer must not alias the caller's input slice
        assert_ne!(out[0].as_ptr(), frame.as_ptr());
    }
}
