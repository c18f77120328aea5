// Transparent per-connection stream compression, installed after IDENTIFY
// negotiation confirms the peer supports it. Wraps an inner `Reader` the same
// way the plain connection does; `feed`/`get` behave identically from the
// caller's perspective, the only difference being that bytes are pushed
// through a streaming (de)compressor first.

use super::codec::{CodecError, Frame, Reader};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::collections::VecDeque;
use std::io::{self, Read};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("deflate stream error")]
    Deflate(#[from] flate2::DecompressError),
    #[error("deflate compression error")]
    DeflateCompress(#[from] flate2::CompressError),
    #[error("snappy stream error: {0}")]
    Snappy(#[source] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A `Reader` wrapped with a streaming decompressor on the read side and a
/// streaming compressor on the write side. Installed in place of the plain
/// codec once IDENTIFY negotiation confirms the peer will compress.
pub enum CompressedReader {
    Deflate(DeflateStream),
    Snappy(SnappyStream),
}

impl CompressedReader {
    pub fn deflate(level: u32) -> Self {
        CompressedReader::Deflate(DeflateStream::new(level))
    }

    pub fn snappy() -> Self {
        CompressedReader::Snappy(SnappyStream::new())
    }

    /// Feed compressed bytes read off the wire.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), CompressionError> {
        match self {
            CompressedReader::Deflate(s) => s.feed(chunk),
            CompressedReader::Snappy(s) => s.feed(chunk),
        }
    }

    /// Pull the next decoded frame, if any.
    pub fn get(&mut self) -> Result<Option<Frame>, CompressionError> {
        match self {
            CompressedReader::Deflate(s) => Ok(s.inner.get()?),
            CompressedReader::Snappy(s) => Ok(s.inner.get()?),
        }
    }

    /// Compress a command's encoded bytes for transmission, ending with a
    /// sync-flush boundary so the peer can decode it without waiting for more
    /// data.
    pub fn encode(&mut self, plain: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            CompressedReader::Deflate(s) => s.compress(plain),
            CompressedReader::Snappy(s) => s.compress(plain),
        }
    }
}

/// Raw DEFLATE (no zlib header, `wbits = -15`) with a sync flush after every
/// encoded command, matching the negotiated `deflate` feature.
pub struct DeflateStream {
    compressor: Compress,
    decompressor: Decompress,
    inner: Reader,
    decompress_buf: Vec<u8>,
}

impl DeflateStream {
    pub fn new(level: u32) -> Self {
        DeflateStream {
            compressor: Compress::new(Compression::new(level), false),
            decompressor: Decompress::new(false),
            inner: Reader::new(),
            decompress_buf: vec![0u8; 8192],
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<(), CompressionError> {
        let mut input = chunk;
        loop {
            let before_in = self.decompressor.total_in();
            let before_out = self.decompressor.total_out();
            let status = self.decompressor.decompress(
                input,
                &mut self.decompress_buf,
                FlushDecompress::Sync,
            )?;
            let consumed = (self.decompressor.total_in() - before_in) as usize;
            let produced = (self.decompressor.total_out() - before_out) as usize;
            if produced > 0 {
                self.inner.feed(&self.decompress_buf[..produced]);
            }
            input = &input[consumed..];
            match status {
                Status::Ok | Status::BufError if !input.is_empty() || produced > 0 => {
                    if input.is_empty() && produced == 0 {
                        break;
                    }
                    continue;
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn compress(&mut self, plain: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(plain.len() + 16);
        let mut buf = [0u8; 8192];
        let mut input = plain;
        loop {
            let before_in = self.compressor.total_in();
            let before_out = self.compressor.total_out();
            let flush = if input.is_empty() {
                FlushCompress::Sync
            } else {
                FlushCompress::None
            };
            let status = self.compressor.compress(input, &mut buf, flush)?;
            let consumed = (self.compressor.total_in() - before_in) as usize;
            let produced = (self.compressor.total_out() - before_out) as usize;
            out.extend_from_slice(&buf[..produced]);
            input = &input[consumed..];
            if input.is_empty() && matches!(flush, FlushCompress::Sync) && status == Status::Ok {
                break;
            }
            if input.is_empty() && produced == 0 && matches!(status, Status::BufError) {
                break;
            }
        }
        Ok(out)
    }
}

/// A byte queue that reports "no data right now" via `WouldBlock` instead of
/// EOF, so a streaming reader built on top of it can be resumed once more
/// bytes arrive. This lets `snap::read::FrameDecoder` be fed incrementally
/// the way the plain `Reader` is.
#[derive(Default)]
struct ByteQueue {
    buf: VecDeque<u8>,
}

impl Read for ByteQueue {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data buffered yet"));
        }
        let n = self.buf.len().min(out.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

/// Snappy streaming frame format (as used by NSQ's `snappy` feature).
pub struct SnappyStream {
    compressor: snap::write::FrameEncoder<Vec<u8>>,
    decompressor: snap::read::FrameDecoder<ByteQueue>,
    inner: Reader,
}

impl SnappyStream {
    pub fn new() -> Self {
        SnappyStream {
            compressor: snap::write::FrameEncoder::new(Vec::new()),
            decompressor: snap::read::FrameDecoder::new(ByteQueue::default()),
            inner: Reader::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<(), CompressionError> {
        self.decompressor.get_mut().buf.extend(chunk.iter().copied());
        let mut buf = [0u8; 8192];
        loop {
            match self.decompressor.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.inner.feed(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(CompressionError::Snappy(e)),
            }
        }
        Ok(())
    }

    fn compress(&mut self, plain: &[u8]) -> Result<Vec<u8>, CompressionError> {
        use std::io::Write;
        self.compressor
            .write_all(plain)
            .map_err(CompressionError::Snappy)?;
        self.compressor.flush().map_err(CompressionError::Snappy)?;
        let produced = std::mem::take(self.compressor.get_mut());
        Ok(produced)
    }
}

impl Default for SnappyStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(frame_type: i32, body: &[u8]) -> Vec<u8> {
        let size = (body.len() + 4) as i32;
        let mut out = Vec::new();
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&frame_type.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn round_trip_single_frame(mut codec: CompressedReader) {
        let plain = frame_bytes(0, b"OK");
        let on_wire = codec.encode(&plain).expect("compress");
        codec.feed(&on_wire).expect("feed compressed bytes");
        let frame = codec.get().expect("decode").expect("a frame");
        assert!(frame.is_ok());
        assert!(codec.get().expect("decode").is_none());
    }

    #[test]
    fn deflate_round_trips_a_single_frame() {
        round_trip_single_frame(CompressedReader::deflate(6));
    }

    #[test]
    fn snappy_round_trips_a_single_frame() {
        round_trip_single_frame(CompressedReader::snappy());
    }

    #[test]
    fn deflate_round_trips_across_multiple_sync_flush_boundaries() {
        let mut codec = CompressedReader::deflate(6);
        let first = frame_bytes(0, b"OK");
        let second = frame_bytes(1, b"E_INVALID bad");

        let wire_one = codec.encode(&first).expect("compress first");
        codec.feed(&wire_one).expect("feed first");
        assert!(codec.get().expect("decode").expect("a frame").is_ok());

        let wire_two = codec.encode(&second).expect("compress second");
        codec.feed(&wire_two).expect("feed second");
        assert!(codec.get().expect("decode").expect("a frame").is_error());
    }

    #[test]
    fn snappy_round_trips_across_multiple_sync_flush_boundaries() {
        let mut codec = CompressedReader::snappy();
        let first = frame_bytes(0, b"OK");
        let second = frame_bytes(1, b"E_INVALID bad");

        let wire_one = codec.encode(&first).expect("compress first");
        codec.feed(&wire_one).expect("feed first");
        assert!(codec.get().expect("decode").expect("a frame").is_ok());

        let wire_two = codec.encode(&second).expect("compress second");
        codec.feed(&wire_two).expect("feed second");
        assert!(codec.get().expect("decode").expect("a frame").is_error());
    }
}
