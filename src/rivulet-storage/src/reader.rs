//! The storage reader and its block iterator.
//!
//! A read opens a connection, sends one [`ReadRequest`], and consumes the
//! framed response stream through a [`BlockIterator`]. The iterator hands
//! out one block per `series` frame; the block's value iterator consumes
//! point frames from the shared stream and signals `done` when it finishes,
//! at which point the outer iterator may advance. There is exactly one
//! active value iterator per block.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{Block, BlockIterator, ColMeta, RowReader, Tags, ValueIterator};
use rivulet_core::{Bounds, DataType, Expression, Time};

use crate::codec::ClientCodec;
use crate::wire::{Frame, ReadRequest, ReadResponse, TimestampRange};

/// Parameters of a storage read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadSpec {
    /// Database to read.
    pub database: String,
    /// Server-side predicate.
    pub predicate: Option<Expression>,
    /// Per-series point limit. The push-down-set limit is authoritative and
    /// goes on the wire.
    pub limit: Option<i64>,
    /// Read points in descending time order.
    pub descending: bool,
}

/// Reads framed columnar data from the storage service.
#[async_trait]
pub trait StorageReader: Send + Sync {
    /// Open a read for `spec` over `[start, stop)` and return its block
    /// iterator.
    async fn read(
        &self,
        spec: ReadSpec,
        start: Time,
        stop: Time,
    ) -> RivuletResult<Box<dyn BlockIterator>>;

    /// Close all open connections.
    fn close(&self);
}

/// RPC-backed storage reader with a mutex-guarded connection pool.
pub struct RpcStorageReader {
    address: String,
    connect_timeout: StdDuration,
    connections: Mutex<Vec<FramedWrite<OwnedWriteHalf, ClientCodec>>>,
}

impl RpcStorageReader {
    /// Create a reader for the given service address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: StdDuration::from_secs(5),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: StdDuration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self) -> RivuletResult<(OwnedReadHalf, OwnedWriteHalf)> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                RivuletError::storage(format!("connect to {} timed out", self.address))
            })?
            .map_err(|e| RivuletError::storage(format!("dial {}: {e}", self.address)))?;
        Ok(stream.into_split())
    }
}

#[async_trait]
impl StorageReader for RpcStorageReader {
    async fn read(
        &self,
        spec: ReadSpec,
        start: Time,
        stop: Time,
    ) -> RivuletResult<Box<dyn BlockIterator>> {
        let (read_half, write_half) = self.connect().await?;
        let mut sink = FramedWrite::new(write_half, ClientCodec::new());

        let request = ReadRequest {
            database: spec.database,
            predicate: spec.predicate,
            descending: spec.descending,
            timestamp_range: TimestampRange {
                start: start.nanos(),
                end: stop.nanos(),
            },
            limit: spec.limit,
        };
        debug!(database = %request.database, range = ?request.timestamp_range, "storage read");
        sink.send(request).await?;

        self.connections
            .lock()
            .expect("connection pool poisoned")
            .push(sink);

        Ok(Box::new(StorageBlockIterator {
            bounds: Bounds::new(start, stop),
            state: Arc::new(AsyncMutex::new(ReadState {
                stream: FramedRead::new(read_half, ClientCodec::new()),
                frames: VecDeque::new(),
                eof: false,
            })),
            pending_done: None,
        }))
    }

    fn close(&self) {
        self.connections
            .lock()
            .expect("connection pool poisoned")
            .clear();
    }
}

/// Buffered view of the response stream.
struct ReadState {
    stream: FramedRead<OwnedReadHalf, ClientCodec>,
    frames: VecDeque<Frame>,
    eof: bool,
}

impl ReadState {
    /// Ensure at least one frame is buffered. `Ok(false)` means clean end
    /// of stream; transport errors are propagated, not collapsed into EOF.
    async fn more(&mut self) -> RivuletResult<bool> {
        while self.frames.is_empty() && !self.eof {
            match self.stream.next().await {
                None => self.eof = true,
                Some(Err(e)) => {
                    self.eof = true;
                    return Err(RivuletError::storage(format!("stream receive: {e}")));
                }
                Some(Ok(ReadResponse { frames })) => self.frames.extend(frames),
            }
        }
        Ok(!self.frames.is_empty())
    }

    fn peek(&self) -> Option<&Frame> {
        self.frames.front()
    }

    fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }
}

/// Iterates the blocks of one storage read.
pub struct StorageBlockIterator {
    bounds: Bounds,
    state: Arc<AsyncMutex<ReadState>>,
    pending_done: Option<watch::Receiver<bool>>,
}

#[async_trait]
impl BlockIterator for StorageBlockIterator {
    async fn next_block(&mut self) -> RivuletResult<Option<Arc<dyn Block>>> {
        // Never advance past a block until its done latch fires. A dropped
        // sender means the block was discarded unread; its point frames are
        // skipped below.
        if let Some(mut rx) = self.pending_done.take() {
            let _ = rx.wait_for(|done| *done).await;
        }

        let mut state = self.state.lock().await;
        let tags = loop {
            if !state.more().await? {
                return Ok(None);
            }
            match state.next_frame() {
                Some(Frame::Series { tags }) => {
                    break tags
                        .into_iter()
                        .map(|t| (t.key, t.value))
                        .collect::<Tags>();
                }
                // Point frames the consumer left unread.
                Some(_) | None => {}
            }
        };

        // The value column's type comes from the first point frame.
        let value_type = if state.more().await? {
            state
                .peek()
                .and_then(Frame::point_type)
                .unwrap_or(DataType::Float)
        } else {
            DataType::Float
        };
        drop(state);

        let mut cols = vec![ColMeta::time(), ColMeta::value(value_type)];
        for key in tags.keys() {
            cols.push(ColMeta::tag(key.clone(), true));
        }

        let (done_tx, done_rx) = watch::channel(false);
        self.pending_done = Some(done_rx);

        Ok(Some(Arc::new(StorageBlock {
            bounds: self.bounds,
            tags,
            cols,
            state: Arc::clone(&self.state),
            done: done_tx,
        })))
    }
}

/// A block streamed from storage: `[time, value]` columns plus one common
/// tag column per series tag.
pub struct StorageBlock {
    bounds: Bounds,
    tags: Tags,
    cols: Vec<ColMeta>,
    state: Arc<AsyncMutex<ReadState>>,
    done: watch::Sender<bool>,
}

impl Block for StorageBlock {
    fn bounds(&self) -> Bounds {
        self.bounds
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn col(&self, j: usize) -> Box<dyn ValueIterator + Send + '_> {
        Box::new(StorageBlockValueIterator {
            block: self,
            col: j,
            time_buf: Vec::new(),
            bool_buf: Vec::new(),
            int_buf: Vec::new(),
            uint_buf: Vec::new(),
            float_buf: Vec::new(),
            string_buf: Vec::new(),
        })
    }
}

fn check_col_type(col: &ColMeta, want: DataType) {
    assert!(
        col.data_type == want,
        "column {:?} is of type {}, not {}",
        col.label,
        col.data_type,
        want
    );
}

/// Value iterator over one column of a storage block, with reusable
/// per-type buffers refilled frame by frame.
struct StorageBlockValueIterator<'a> {
    block: &'a StorageBlock,
    col: usize,

    time_buf: Vec<Time>,
    bool_buf: Vec<bool>,
    int_buf: Vec<i64>,
    uint_buf: Vec<u64>,
    float_buf: Vec<f64>,
    string_buf: Vec<String>,
}

impl StorageBlockValueIterator<'_> {
    /// Pull the next point frame into the buffers. `Ok(false)` at the next
    /// series frame or end of stream.
    async fn advance(&mut self) -> RivuletResult<bool> {
        let mut state = self.block.state.lock().await;
        if !state.more().await? {
            return Ok(false);
        }
        if state.peek().is_some_and(Frame::is_series) {
            return Ok(false);
        }
        let Some(frame) = state.next_frame() else {
            return Ok(false);
        };
        drop(state);

        self.time_buf.clear();
        self.bool_buf.clear();
        self.int_buf.clear();
        self.uint_buf.clear();
        self.float_buf.clear();
        self.string_buf.clear();

        let value_type = self.block.cols[1].data_type;
        let frame_type = frame.point_type();
        if frame_type != Some(value_type) {
            return Err(RivuletError::storage(format!(
                "unexpected {:?} frame in a block of {value_type} points",
                frame_type
            )));
        }

        match frame {
            Frame::IntegerPoints { timestamps, values } => {
                self.time_buf.extend(timestamps.into_iter().map(Time));
                self.int_buf = values;
            }
            Frame::FloatPoints { timestamps, values } => {
                self.time_buf.extend(timestamps.into_iter().map(Time));
                self.float_buf = values;
            }
            Frame::StringPoints { timestamps, values } => {
                self.time_buf.extend(timestamps.into_iter().map(Time));
                self.string_buf = values;
            }
            Frame::BooleanPoints { timestamps, values } => {
                self.time_buf.extend(timestamps.into_iter().map(Time));
                self.bool_buf = values;
            }
            Frame::UnsignedPoints { timestamps, values } => {
                self.time_buf.extend(timestamps.into_iter().map(Time));
                self.uint_buf = values;
            }
            Frame::Series { .. } => unreachable!("series frames end the block"),
        }
        Ok(true)
    }

    fn signal_done(&self) {
        let _ = self.block.done.send(true);
    }
}

#[async_trait]
impl ValueIterator for StorageBlockValueIterator<'_> {
    async fn do_bool(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [bool], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Bool);
        loop {
            match self.advance().await {
                Ok(true) => {
                    let this = &*self;
                    f(&this.bool_buf, this);
                }
                Ok(false) => break,
                Err(e) => {
                    self.signal_done();
                    return Err(e);
                }
            }
        }
        self.signal_done();
        Ok(())
    }

    async fn do_int(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [i64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Int);
        loop {
            match self.advance().await {
                Ok(true) => {
                    let this = &*self;
                    f(&this.int_buf, this);
                }
                Ok(false) => break,
                Err(e) => {
                    self.signal_done();
                    return Err(e);
                }
            }
        }
        self.signal_done();
        Ok(())
    }

    async fn do_uint(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [u64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::UInt);
        loop {
            match self.advance().await {
                Ok(true) => {
                    let this = &*self;
                    f(&this.uint_buf, this);
                }
                Ok(false) => break,
                Err(e) => {
                    self.signal_done();
                    return Err(e);
                }
            }
        }
        self.signal_done();
        Ok(())
    }

    async fn do_float(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [f64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Float);
        loop {
            match self.advance().await {
                Ok(true) => {
                    let this = &*self;
                    f(&this.float_buf, this);
                }
                Ok(false) => break,
                Err(e) => {
                    self.signal_done();
                    return Err(e);
                }
            }
        }
        self.signal_done();
        Ok(())
    }

    async fn do_string(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [String], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::String);
        loop {
            match self.advance().await {
                Ok(true) => {
                    let this = &*self;
                    f(&this.string_buf, this);
                }
                Ok(false) => break,
                Err(e) => {
                    self.signal_done();
                    return Err(e);
                }
            }
        }
        self.signal_done();
        Ok(())
    }

    async fn do_time(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [Time], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Time);
        loop {
            match self.advance().await {
                Ok(true) => {
                    let this = &*self;
                    f(&this.time_buf, this);
                }
                Ok(false) => break,
                Err(e) => {
                    self.signal_done();
                    return Err(e);
                }
            }
        }
        self.signal_done();
        Ok(())
    }
}

impl RowReader for StorageBlockValueIterator<'_> {
    fn cols(&self) -> &[ColMeta] {
        &self.block.cols
    }

    fn at_bool(&self, i: usize, j: usize) -> bool {
        check_col_type(&self.block.cols[j], DataType::Bool);
        self.bool_buf[i]
    }

    fn at_int(&self, i: usize, j: usize) -> i64 {
        check_col_type(&self.block.cols[j], DataType::Int);
        self.int_buf[i]
    }

    fn at_uint(&self, i: usize, j: usize) -> u64 {
        check_col_type(&self.block.cols[j], DataType::UInt);
        self.uint_buf[i]
    }

    fn at_float(&self, i: usize, j: usize) -> f64 {
        check_col_type(&self.block.cols[j], DataType::Float);
        self.float_buf[i]
    }

    fn at_string(&self, i: usize, j: usize) -> &str {
        let col = &self.block.cols[j];
        check_col_type(col, DataType::String);
        if col.is_tag {
            return self
                .block
                .tags
                .get(&col.label)
                .map_or("", String::as_str);
        }
        &self.string_buf[i]
    }

    fn at_time(&self, i: usize, j: usize) -> Time {
        check_col_type(&self.block.cols[j], DataType::Time);
        self.time_buf[i]
    }
}
