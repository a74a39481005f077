//! Remote columnar storage client.
//!
//! The storage service streams framed columnar data: a `series` frame opens
//! a block, point frames carry parallel timestamp/value arrays for it until
//! the next series frame or end of stream. This crate provides the wire
//! types, the length-prefixed codec, and the [`StorageReader`] that turns a
//! read into a block iterator honoring the block-then-wait handshake.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
mod reader;
pub mod wire;

pub use reader::{ReadSpec, RpcStorageReader, StorageBlockIterator, StorageReader};
pub use wire::{Frame, ReadRequest, ReadResponse, Tag, TimestampRange};
