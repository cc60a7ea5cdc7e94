#![forbid(unsafe_code)]
//! Streaming blob compression.
//!
//! The writer feeds each incoming chunk through a `StreamingCompressor`
//! while it buffers the raw bytes. If at any point the compressed stream
//! stops paying for itself (see [`MIN_BYTES_SAVED`]), the writer calls
//! [`StreamingCompressor::reset`] and the blob is stored raw.

use sealfs_error::{Result, SealError};
use sealfs_types::BLOCK_SIZE;
use std::io::Write;
use zstd::stream::write::Encoder;

/// Compression must save at least one block, or it is abandoned.
pub const MIN_BYTES_SAVED: u64 = BLOCK_SIZE as u64;

/// zstd level used for blob payloads.
pub const COMPRESSION_LEVEL: i32 = 3;

/// Worst-case compressed size for `input_len` bytes of input.
#[must_use]
pub fn buffer_max(input_len: usize) -> usize {
    zstd::zstd_safe::compress_bound(input_len)
}

/// Incremental compressor for a single blob.
///
/// Lifecycle: `new` → zero or more `update`s → `end` → `output`. `reset`
/// aborts at any point and leaves the compressor inert; every later call
/// then reports `BadState` except `size`, which reports zero.
pub struct StreamingCompressor {
    encoder: Option<Encoder<'static, Vec<u8>>>,
    finished: Option<Vec<u8>>,
}

impl StreamingCompressor {
    /// Start a compression stream with an output buffer sized for
    /// `capacity` bytes of compressed data.
    pub fn new(capacity: usize) -> Result<Self> {
        let encoder = Encoder::new(Vec::with_capacity(capacity), COMPRESSION_LEVEL)
            .map_err(SealError::Io)?;
        Ok(Self {
            encoder: Some(encoder),
            finished: None,
        })
    }

    /// Whether the stream is live (not aborted), before or after `end`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.encoder.is_some() || self.finished.is_some()
    }

    /// Feed one chunk of raw blob data.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(SealError::BadState);
        };
        encoder.write_all(data).map_err(SealError::Io)
    }

    /// Finalize the stream. After this, `output` returns the payload.
    pub fn end(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.take() else {
            return Err(SealError::BadState);
        };
        self.finished = Some(encoder.finish().map_err(SealError::Io)?);
        Ok(())
    }

    /// Compressed bytes produced so far. The final frame epilogue is only
    /// accounted after `end`, so the abort check runs both per-chunk and
    /// once more on completion.
    #[must_use]
    pub fn size(&self) -> u64 {
        match (&self.encoder, &self.finished) {
            (Some(encoder), _) => encoder.get_ref().len() as u64,
            (None, Some(out)) => out.len() as u64,
            (None, None) => 0,
        }
    }

    /// Abort: discard all compressed state.
    pub fn reset(&mut self) {
        self.encoder = None;
        self.finished = None;
    }

    /// The finished compressed payload, once `end` has run.
    #[must_use]
    pub fn output(&self) -> Option<&[u8]> {
        self.finished.as_deref()
    }
}

/// One-shot decompression of a complete compressed payload.
///
/// The payload sits in whole blocks on disk, so trailing zero padding
/// after the frame is expected and ignored. The caller is responsible for
/// checking the decompressed length against the blob's declared size; a
/// mismatch there is an integrity failure, not a decoder failure.
pub fn decompress(src: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = zstd::stream::read::Decoder::new(src)
        .map_err(SealError::Io)?
        .single_frame();
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out).map_err(SealError::Io)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data: Vec<u8> = (0..100_000_u32).map(|i| (i % 7) as u8).collect();
        let mut comp = StreamingCompressor::new(buffer_max(data.len())).expect("new");
        for chunk in data.chunks(4096) {
            comp.update(chunk).expect("update");
        }
        comp.end().expect("end");

        let out = comp.output().expect("output").to_vec();
        assert!(!out.is_empty());
        assert_eq!(decompress(&out).expect("decompress"), data);
    }

    #[test]
    fn repetitive_data_saves_a_block() {
        let data = vec![0_u8; 256 * 1024];
        let mut comp = StreamingCompressor::new(buffer_max(data.len())).expect("new");
        comp.update(&data).expect("update");
        comp.end().expect("end");
        assert!(comp.size() + MIN_BYTES_SAVED < data.len() as u64);
    }

    #[test]
    fn reset_aborts() {
        let mut comp = StreamingCompressor::new(1024).expect("new");
        comp.update(b"some data").expect("update");
        comp.reset();
        assert!(!comp.is_active());
        assert_eq!(comp.size(), 0);
        assert!(matches!(comp.update(b"more"), Err(SealError::BadState)));
        assert!(matches!(comp.end(), Err(SealError::BadState)));
        assert!(comp.output().is_none());
    }

    #[test]
    fn update_after_end_is_bad_state() {
        let mut comp = StreamingCompressor::new(1024).expect("new");
        comp.update(b"payload").expect("update");
        comp.end().expect("end");
        assert!(comp.is_active());
        assert!(matches!(comp.update(b"late"), Err(SealError::BadState)));
        assert!(matches!(comp.end(), Err(SealError::BadState)));
    }

    #[test]
    fn empty_stream_decodes_to_nothing() {
        let mut comp = StreamingCompressor::new(64).expect("new");
        comp.end().expect("end");
        let out = comp.output().expect("output").to_vec();
        assert_eq!(decompress(&out).expect("decompress"), Vec::<u8>::new());
    }

    #[test]
    fn block_padding_after_the_frame_is_ignored() {
        let data = vec![7_u8; 40_000];
        let mut comp = StreamingCompressor::new(buffer_max(data.len())).expect("new");
        comp.update(&data).expect("update");
        comp.end().expect("end");

        let mut padded = comp.output().expect("output").to_vec();
        let target = padded.len().div_ceil(BLOCK_SIZE as usize) * BLOCK_SIZE as usize;
        padded.resize(target, 0);
        assert_eq!(decompress(&padded).expect("decompress"), data);
    }

    #[test]
    fn garbage_input_fails_decompression() {
        assert!(decompress(&[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }
}
