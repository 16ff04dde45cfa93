//! Length-prefixed framing
//!
//! Frames are `<u32 big-endian length><payload>`. Sentinel-byte framing is
//! off the table: payloads are ciphertext and may contain any byte value.
//! A frame whose declared length exceeds the ceiling is consumed from the
//! stream and discarded, so one oversized message cannot wedge the channel.

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Write one frame. The caller enforces the size ceiling on its own
/// payloads before sealing them.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Bug(format!("frame of {} bytes cannot be length-prefixed", payload.len())))?;
    writer
        .write_all(&len.to_be_bytes())
        .and_then(|()| writer.write_all(payload))
        .and_then(|()| writer.flush())
        .map_err(io_to_channel)
}

/// Read one frame, enforcing `max_len`. An oversized frame is skipped in
/// full and reported as [`Error::FrameTooLarge`]; the stream stays aligned
/// on the next frame boundary.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).map_err(io_to_channel)?;
    let declared = u32::from_be_bytes(header) as usize;

    if declared > max_len {
        skip_exact(reader, declared)?;
        return Err(Error::FrameTooLarge { declared, limit: max_len });
    }

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).map_err(io_to_channel)?;
    Ok(payload)
}

fn skip_exact<R: Read>(reader: &mut R, mut remaining: usize) -> Result<()> {
    let mut sink = [0u8; 4096];
    while remaining > 0 {
        let take = remaining.min(sink.len());
        reader.read_exact(&mut sink[..take]).map_err(io_to_channel)?;
        remaining -= take;
    }
    Ok(())
}

/// A peer hanging up mid-frame is a closed channel, not an I/O bug.
fn io_to_channel(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset => Error::ChannelClosed,
        _ => Error::io("channel stream", e),
    }
}
