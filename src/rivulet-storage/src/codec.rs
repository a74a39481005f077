//! Length-prefixed codecs for the storage RPC.
//!
//! Every message is a u32 big-endian length followed by a JSON body. Both
//! sides enforce a maximum message size so a corrupt length prefix cannot
//! force an unbounded allocation.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use common_error::RivuletError;

use crate::wire::{ReadRequest, ReadResponse};

/// Maximum message size in bytes (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

fn decode_payload(src: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, RivuletError> {
    if src.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    len_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max {
        return Err(RivuletError::storage(format!(
            "message of {len} bytes exceeds maximum of {max}"
        )));
    }
    if src.len() < LENGTH_PREFIX + len {
        src.reserve(LENGTH_PREFIX + len - src.len());
        return Ok(None);
    }
    src.advance(LENGTH_PREFIX);
    Ok(Some(src.split_to(len)))
}

fn encode_payload(dst: &mut BytesMut, payload: &[u8], max: usize) -> Result<(), RivuletError> {
    if payload.len() > max {
        return Err(RivuletError::storage(format!(
            "message of {} bytes exceeds maximum of {max}",
            payload.len()
        )));
    }
    dst.reserve(LENGTH_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Client-side codec: encodes [`ReadRequest`], decodes [`ReadResponse`].
#[derive(Debug)]
pub struct ClientCodec {
    max_message_size: usize,
}

impl ClientCodec {
    /// Create a client codec with the default maximum message size.
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<ReadRequest> for ClientCodec {
    type Error = RivuletError;

    fn encode(&mut self, item: ReadRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        encode_payload(dst, &payload, self.max_message_size)
    }
}

impl Decoder for ClientCodec {
    type Item = ReadResponse;
    type Error = RivuletError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_payload(src, self.max_message_size)? {
            None => Ok(None),
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        }
    }
}

/// Server-side codec: decodes [`ReadRequest`], encodes [`ReadResponse`].
/// Used by the in-process storage service in tests.
#[derive(Debug)]
pub struct ServerCodec {
    max_message_size: usize,
}

impl ServerCodec {
    /// Create a server codec with the default maximum message size.
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<ReadResponse> for ServerCodec {
    type Error = RivuletError;

    fn encode(&mut self, item: ReadResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        encode_payload(dst, &payload, self.max_message_size)
    }
}

impl Decoder for ServerCodec {
    type Item = ReadRequest;
    type Error = RivuletError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_payload(src, self.max_message_size)? {
            None => Ok(None),
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        }
    }
}
