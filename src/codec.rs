//! Length-prefixed zlib framing for bus envelopes.
//!
//! Wire format per message: 4-byte little-endian payload length, then that
//! many bytes of zlib-compressed JSON.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{classify_io, BusError, NetErrorKind, Result};
use crate::message::Envelope;

/// Frames declaring more than this are rejected before allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// JSON-marshals and zlib-compresses one envelope into a frame payload.
pub fn encode_envelope(msg: &Envelope) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(msg).map_err(BusError::Marshal)?;
    compress(&raw)
}

/// Decompresses and JSON-unmarshals one frame payload.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope> {
    let raw = decompress(payload)?;
    serde_json::from_slice(&raw).map_err(BusError::Unmarshal)
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(BusError::Compress)?;
    encoder.finish().map_err(BusError::Compress)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut raw)
        .map_err(BusError::Decompress)?;
    Ok(raw)
}

/// Writes one frame: length prefix, payload, flush. The caller must hold the
/// connection's write lock so the prefix and payload reach the wire as one
/// unit relative to other writers.
///
/// A failure on the length prefix is classified for the reconnect decision;
/// once the prefix is out, a failure is a plain write failure.
pub async fn write_frame<W>(sink: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = (payload.len() as u32).to_le_bytes();
    sink.write_all(&len)
        .await
        .map_err(|err| BusError::net(classify_io(&err), err))?;
    sink.write_all(payload)
        .await
        .map_err(|err| BusError::net(NetErrorKind::WriteFail, err))?;
    sink.flush()
        .await
        .map_err(|err| BusError::net(NetErrorKind::WriteFail, err))?;
    Ok(())
}

/// Reads one frame with read-full semantics: exactly 4 length bytes, then
/// exactly that many payload bytes.
pub async fn read_frame<R>(source: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    source
        .read_exact(&mut len_buf)
        .await
        .map_err(|err| BusError::net(classify_io(&err), err))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(BusError::FrameTooLarge { got: len, cap: MAX_FRAME_BYTES });
    }
    let mut payload = vec![0u8; len];
    source
        .read_exact(&mut payload)
        .await
        .map_err(|err| BusError::net(NetErrorKind::ReadFail, err))?;
    Ok(payload)
}
