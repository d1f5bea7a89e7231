//! Transparent gzip framing for a connection's two directions.
//!
//! The encoder sync-flushes after every write so the peer can decode what
//! it has received so far; the decoder accepts bytes incrementally and
//! never requires the stream's trailer.

use std::io::Write;

use flate2::{write::GzDecoder, write::GzEncoder, Compression};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorKind, Result};

const RAW_CHUNK: usize = 8 * 1024;

/// Compresses writes into a gzip stream over `W`.
pub(super) struct GzipWriter<W> {
    inner: W,
    encoder: GzEncoder<Vec<u8>>,
}

impl<W: AsyncWrite + Unpin> GzipWriter<W> {
    pub(super) fn new(inner: W) -> Self {
        Self {
            inner,
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }

    /// Compresses `buf` and writes the resulting frame, flushing so the
    /// bytes are observable by the peer before this returns.
    pub(super) async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.encoder
            .write_all(buf)
            .and_then(|_| self.encoder.flush())
            .map_err(compression_error)?;

        let compressed = std::mem::take(self.encoder.get_mut());
        self.inner.write_all(&compressed).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub(super) async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Decompresses a gzip stream read from `R`.
pub(super) struct GzipReader<R> {
    inner: R,
    decoder: GzDecoder<Vec<u8>>,
    offset: usize,
}

impl<R: AsyncRead + Unpin> GzipReader<R> {
    pub(super) fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: GzDecoder::new(Vec::new()),
            offset: 0,
        }
    }

    /// Reads decompressed bytes into `buf`, pulling more compressed input
    /// as needed. Returns 0 only at end of stream.
    pub(super) async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let decoded = self.decoder.get_ref();
            if self.offset < decoded.len() {
                let n = (decoded.len() - self.offset).min(buf.len());
                buf[..n].copy_from_slice(&decoded[self.offset..self.offset + n]);
                self.offset += n;
                if self.offset == self.decoder.get_ref().len() {
                    self.decoder.get_mut().clear();
                    self.offset = 0;
                }
                return Ok(n);
            }

            let mut raw = [0u8; RAW_CHUNK];
            let n = self.inner.read(&mut raw).await?;
            if n == 0 {
                return Ok(0);
            }
            self.decoder
                .write_all(&raw[..n])
                .and_then(|_| self.decoder.flush())
                .map_err(compression_error)?;
        }
    }
}

fn compression_error(e: std::io::Error) -> crate::error::Error {
    ErrorKind::Internal {
        message: format!("gzip stream error: {}", e),
    }
    .into()
}
