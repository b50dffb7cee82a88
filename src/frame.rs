//! Length-prefixed framing
//!
//! ```text
//! +----------------------------+------------------+
//! | Length N (4 bytes, BE)     | N payload bytes  |
//! +----------------------------+------------------+
//! ```
//!
//! The length is checked against the configured maximum before the payload
//! buffer is allocated.

use std::io::{self, Read, Write};

use crate::error::ProtocolError;

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Encode one frame into a fresh buffer
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let len = checked_len(payload.len(), max_frame_size)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one frame to `writer`
pub fn write_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<(), ProtocolError> {
    let frame = encode_frame(payload, max_frame_size)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

fn checked_len(len: usize, max_frame_size: usize) -> Result<u32, ProtocolError> {
    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

/// Reads consecutive frames from a byte stream
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a reader
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary. An
    /// oversized length prefix is rejected without reading its payload.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let got = read_full(&mut self.inner, &mut prefix)?;
        if got == 0 {
            return Ok(None);
        }
        if got < LENGTH_PREFIX_LEN {
            return Err(ProtocolError::Truncated {
                expected: LENGTH_PREFIX_LEN,
                actual: got,
            });
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut payload = vec![0u8; len];
        let got = read_full(&mut self.inner, &mut payload)?;
        if got < len {
            return Err(ProtocolError::Truncated {
                expected: len,
                actual: got,
            });
        }
        Ok(Some(payload))
    }

    /// Underlying reader
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
