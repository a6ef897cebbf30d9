//! # Byte Streams
//!
//! Input and output streams are the two ends of a bounded byte [`Pipe`]. The caller owns
//! one end; the other end is either another caller-owned stream (memory pipes) or a
//! background task pumping bytes between the pipe and a native reader or writer (TCP
//! connections, stdio, the discard sink).
//!
//! Non-blocking operations never wait: reading an empty pipe is `would-block`, and
//! writing more than `check-write` allowed is `invalid-argument`. Blocking variants wait
//! on the pipe's notifier. Dropping a stream closes its end, which wakes and fails any
//! blocked operation with `closed`.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::poll::Pollable;
use super::shared::{Readiness, Shared};
use crate::bridge::Call;
use crate::errors::{Error, ErrorCode, IoError, StreamError};
use crate::handler::{unsupported, Handler, HandlerResult};
use crate::opcode::{BaseOp, ResourceTag};
use crate::store::IoStore;
use crate::table::Handle;
use crate::value::Value;

/// What to create behind a new stream handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamSpec {
    /// Input stream over a fixed byte buffer, at end-of-stream once drained
    Bytes(Vec<u8>),
    Stdin,
    Stdout,
    Stderr,
    /// Output stream that accepts and drops everything
    Discard,
    /// Connected (output, input) pair
    Pipe { capacity: Option<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputSource {
    Memory,
    Pipe,
    Tcp,
    Stdin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputSink {
    Pipe,
    Tcp,
    Stdout,
    Stderr,
    Discard,
}

#[derive(Debug)]
pub struct PipeState {
    buffer: BytesMut,
    capacity: usize,
    /// Bytes taken by a sink task but not yet confirmed written
    in_flight: usize,
    /// No more bytes will be pushed
    writer_closed: bool,
    /// No more bytes will be taken
    reader_closed: bool,
    /// Reported once to whichever caller-facing end asks next
    error: Option<IoError>,
}

pub type Pipe = Shared<PipeState>;

impl PipeState {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            capacity: capacity.max(1),
            in_flight: 0,
            writer_closed: false,
            reader_closed: false,
            error: None,
        }
    }

    fn available(&self) -> usize {
        self.capacity
            .saturating_sub(self.buffer.len() + self.in_flight)
    }

    // Producer side

    fn check_write(&mut self) -> Result<usize, StreamError> {
        if self.writer_closed {
            return Err(StreamError::Closed);
        }
        if let Some(cause) = self.error.take() {
            self.writer_closed = true;
            return Err(StreamError::LastOperationFailed(cause));
        }
        if self.reader_closed {
            return Err(StreamError::Closed);
        }
        Ok(self.available())
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn push_zeroes(&mut self, n: usize) {
        let len = self.buffer.len();
        self.buffer.resize(len + n, 0);
    }

    /// End-of-stream from the producer. Buffered bytes stay readable.
    pub fn finish(&mut self) {
        self.writer_closed = true;
    }

    /// The native source feeding this pipe failed.
    pub fn source_failed(&mut self, cause: IoError) {
        self.error = Some(cause);
        self.writer_closed = true;
    }

    /// `Some(None)` once nothing more can be pushed.
    fn room_for_source(&mut self) -> Option<Option<usize>> {
        if self.reader_closed || self.writer_closed {
            return Some(None);
        }
        match self.available() {
            0 => None,
            room => Some(Some(room)),
        }
    }

    fn drained(&mut self) -> Option<Result<(), StreamError>> {
        if self.writer_closed {
            return Some(Err(StreamError::Closed));
        }
        if let Some(cause) = self.error.take() {
            self.writer_closed = true;
            return Some(Err(StreamError::LastOperationFailed(cause)));
        }
        if self.reader_closed {
            return Some(Err(StreamError::Closed));
        }
        (self.buffer.is_empty() && self.in_flight == 0).then_some(Ok(()))
    }

    // Consumer side

    fn try_take(&mut self, len: usize) -> Result<Option<Bytes>, StreamError> {
        if self.reader_closed {
            return Err(StreamError::Closed);
        }
        if !self.buffer.is_empty() {
            let n = len.min(self.buffer.len());
            return Ok(Some(self.buffer.split_to(n).freeze()));
        }
        if let Some(cause) = self.error.take() {
            self.reader_closed = true;
            return Err(StreamError::LastOperationFailed(cause));
        }
        if self.writer_closed {
            return Err(StreamError::Closed);
        }
        Ok(None)
    }

    /// Hand the whole buffer to a sink task. `Some(None)` once the sink should stop.
    fn next_chunk(&mut self) -> Option<Option<Bytes>> {
        if self.reader_closed {
            return Some(None);
        }
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            self.in_flight = chunk.len();
            return Some(Some(chunk));
        }
        self.writer_closed.then_some(None)
    }

    pub fn close_reader(&mut self) {
        self.reader_closed = true;
    }

    /// The native sink draining this pipe failed.
    pub fn sink_failed(&mut self, cause: IoError) {
        self.error = Some(cause);
        self.reader_closed = true;
        self.in_flight = 0;
    }

    fn readable(&self) -> bool {
        !self.buffer.is_empty() || self.reader_closed || self.writer_closed || self.error.is_some()
    }

    fn writable(&self) -> bool {
        self.available() > 0 || self.reader_closed || self.writer_closed || self.error.is_some()
    }
}

fn clamp_len(len: u64) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX)
}

/// Copy a native reader into `pipe` until end-of-file, failure, or cancellation.
pub async fn pump_reads<R>(mut reader: R, pipe: Arc<Pipe>, cancel: CancellationToken, chunk: usize)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; chunk.max(1)];
    loop {
        let room = tokio::select! {
            _ = cancel.cancelled() => break,
            room = pipe.wait_for(PipeState::room_for_source) => room,
        };
        let Some(room) = room else { break };
        let limit = room.min(buf.len());

        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf[..limit]) => read,
        };
        match read {
            Ok(0) => {
                debug!("stream source reached end of file");
                pipe.update(PipeState::finish);
                break;
            }
            Ok(n) => pipe.update(|state| state.push(&buf[..n])),
            Err(err) => {
                warn!("stream source failed: {}", err);
                pipe.update(|state| state.source_failed(err.into()));
                break;
            }
        }
    }
}

/// Drain `pipe` into a native writer until the producer finishes, the sink fails, or
/// cancellation. The writer is shut down after a clean finish.
pub async fn pump_writes<W>(mut writer: W, pipe: Arc<Pipe>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = pipe.wait_for(PipeState::next_chunk) => chunk,
        };
        let Some(chunk) = chunk else {
            if let Err(err) = writer.shutdown().await {
                debug!("stream sink shutdown failed: {}", err);
            }
            break;
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = async {
                writer.write_all(&chunk).await?;
                writer.flush().await
            } => written,
        };
        match written {
            Ok(()) => pipe.update(|state| state.in_flight = 0),
            Err(err) => {
                warn!("stream sink failed: {}", err);
                pipe.update(|state| state.sink_failed(err.into()));
                break;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputStream {
    pipe: Arc<Pipe>,
    source: InputSource,
    task: CancellationToken,
}

impl InputStream {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut state = PipeState::new(data.len());
        state.push(&data);
        state.finish();
        Self {
            pipe: Shared::new(state),
            source: InputSource::Memory,
            task: CancellationToken::new(),
        }
    }

    pub fn from_pipe(pipe: Arc<Pipe>, source: InputSource, task: CancellationToken) -> Self {
        Self { pipe, source, task }
    }

    /// Stream fed by a background task reading `reader`.
    pub fn spawn_reader<R>(
        reader: R,
        source: InputSource,
        capacity: usize,
        chunk: usize,
        cancel: CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pipe = Shared::new(PipeState::new(capacity));
        tokio::spawn(pump_reads(reader, Arc::clone(&pipe), cancel.clone(), chunk));
        Self::from_pipe(pipe, source, cancel)
    }

    pub fn source(&self) -> InputSource {
        self.source
    }

    pub fn read(&self, len: u64) -> Result<Vec<u8>, Error> {
        let len = clamp_len(len);
        match self.pipe.update(|state| state.try_take(len))? {
            Some(bytes) => Ok(bytes.to_vec()),
            None if len == 0 => Ok(Vec::new()),
            None => Err(ErrorCode::WouldBlock.into()),
        }
    }

    pub async fn blocking_read(&self, len: u64) -> Result<Vec<u8>, Error> {
        if len == 0 {
            return self.read(0);
        }
        let len = clamp_len(len);
        let bytes = self
            .pipe
            .wait_for(|state| state.try_take(len).transpose())
            .await?;
        Ok(bytes.to_vec())
    }

    pub fn skip(&self, len: u64) -> Result<u64, Error> {
        self.read(len).map(|bytes| bytes.len() as u64)
    }

    pub async fn blocking_skip(&self, len: u64) -> Result<u64, Error> {
        self.blocking_read(len).await.map(|bytes| bytes.len() as u64)
    }

    pub fn subscribe(&self) -> Pollable {
        Pollable::event(Readiness::new(&self.pipe, PipeState::readable))
    }

    /// Close the reading end and stop any feeding task.
    pub fn close(&self) {
        self.task.cancel();
        self.pipe.update(PipeState::close_reader);
    }
}

#[derive(Debug, Clone)]
pub struct OutputStream {
    pipe: Arc<Pipe>,
    sink: OutputSink,
}

impl OutputStream {
    pub fn from_pipe(pipe: Arc<Pipe>, sink: OutputSink) -> Self {
        Self { pipe, sink }
    }

    /// Stream drained by a background task writing to `writer`.
    pub fn spawn_writer<W>(writer: W, sink: OutputSink, capacity: usize, cancel: CancellationToken) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pipe = Shared::new(PipeState::new(capacity));
        tokio::spawn(pump_writes(writer, Arc::clone(&pipe), cancel));
        Self::from_pipe(pipe, sink)
    }

    /// Connected memory pipe: bytes written to the output are read from the input.
    pub fn pipe(capacity: usize) -> (OutputStream, InputStream) {
        let pipe = Shared::new(PipeState::new(capacity));
        let output = OutputStream::from_pipe(Arc::clone(&pipe), OutputSink::Pipe);
        let input = InputStream::from_pipe(pipe, InputSource::Pipe, CancellationToken::new());
        (output, input)
    }

    pub fn sink(&self) -> OutputSink {
        self.sink
    }

    pub fn check_write(&self) -> Result<u64, Error> {
        let permit = self.pipe.update(PipeState::check_write)?;
        Ok(permit as u64)
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        self.pipe.update(|state| -> Result<(), Error> {
            let permit = state.check_write()?;
            if bytes.len() > permit {
                return Err(Error::detailed(
                    ErrorCode::InvalidArgument,
                    format!("write of {} bytes exceeds permit of {}", bytes.len(), permit),
                ));
            }
            state.push(bytes);
            Ok(())
        })
    }

    pub async fn blocking_write_and_flush(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let written = self
                .pipe
                .wait_for(|state| match state.check_write() {
                    Ok(0) => None,
                    Ok(permit) => {
                        let n = permit.min(rest.len());
                        state.push(&rest[..n]);
                        Some(Ok(n))
                    }
                    Err(e) => Some(Err(e)),
                })
                .await?;
            rest = &rest[written..];
        }
        self.blocking_flush().await
    }

    /// Buffered bytes are drained continuously, so a non-blocking flush only validates
    /// that the stream is still usable.
    pub fn flush(&self) -> Result<(), Error> {
        self.pipe.update(PipeState::check_write)?;
        Ok(())
    }

    pub async fn blocking_flush(&self) -> Result<(), Error> {
        self.pipe.wait_for(PipeState::drained).await?;
        Ok(())
    }

    /// Zero-filled counterpart of `write`. Nothing is allocated beyond the permit.
    pub fn write_zeroes(&self, len: u64) -> Result<(), Error> {
        self.pipe.update(|state| -> Result<(), Error> {
            let permit = state.check_write()?;
            if len > permit as u64 {
                return Err(Error::detailed(
                    ErrorCode::InvalidArgument,
                    format!("write of {} zeroes exceeds permit of {}", len, permit),
                ));
            }
            state.push_zeroes(permit.min(clamp_len(len)));
            Ok(())
        })
    }

    pub async fn blocking_write_zeroes_and_flush(&self, len: u64) -> Result<(), Error> {
        let mut rest = len;
        while rest > 0 {
            let written = self
                .pipe
                .wait_for(|state| match state.check_write() {
                    Ok(0) => None,
                    Ok(permit) => {
                        let n = permit.min(clamp_len(rest));
                        state.push_zeroes(n);
                        Some(Ok(n))
                    }
                    Err(e) => Some(Err(e)),
                })
                .await?;
            rest -= written as u64;
        }
        self.blocking_flush().await
    }

    /// Move up to `len` bytes from `src` without waiting.
    pub fn splice(&self, src: &InputStream, len: u64) -> Result<u64, Error> {
        let want = len.min(self.check_write()?);
        if want == 0 {
            return Ok(0);
        }
        let bytes = match src.read(want) {
            Ok(bytes) => bytes,
            Err(e) if e.code() == Some(ErrorCode::WouldBlock) => return Ok(0),
            Err(e) => return Err(e),
        };
        self.write(&bytes)?;
        Ok(bytes.len() as u64)
    }

    pub async fn blocking_splice(&self, src: &InputStream, len: u64) -> Result<u64, Error> {
        let permit = self
            .pipe
            .wait_for(|state| match state.check_write() {
                Ok(0) => None,
                other => Some(other),
            })
            .await?;
        let bytes = src.blocking_read(len.min(permit as u64)).await?;
        self.write(&bytes)?;
        Ok(bytes.len() as u64)
    }

    pub fn subscribe(&self) -> Pollable {
        Pollable::event(Readiness::new(&self.pipe, PipeState::writable))
    }

    /// End-of-stream for the reader. A sink task drains what is buffered, then stops.
    pub fn close(&self) {
        self.pipe.update(PipeState::finish);
    }
}

/// Build the stream(s) a `create` call asks for. Returns the new handles.
fn create(store: &IoStore, spec: StreamSpec) -> Result<Value, Error> {
    let streams = &store.config().streams;
    let capacity = streams.buffer_capacity;
    let mut table = store.table();
    match spec {
        StreamSpec::Bytes(data) => table.push(InputStream::from_bytes(data)).map(Value::Handle),
        StreamSpec::Stdin => {
            let stream = InputStream::spawn_reader(
                tokio::io::stdin(),
                InputSource::Stdin,
                capacity,
                streams.read_chunk_size,
                CancellationToken::new(),
            );
            table.push(stream).map(Value::Handle)
        }
        StreamSpec::Stdout => {
            let stream = OutputStream::spawn_writer(
                tokio::io::stdout(),
                OutputSink::Stdout,
                capacity,
                CancellationToken::new(),
            );
            table.push(stream).map(Value::Handle)
        }
        StreamSpec::Stderr => {
            let stream = OutputStream::spawn_writer(
                tokio::io::stderr(),
                OutputSink::Stderr,
                capacity,
                CancellationToken::new(),
            );
            table.push(stream).map(Value::Handle)
        }
        StreamSpec::Discard => {
            let stream = OutputStream::spawn_writer(
                tokio::io::sink(),
                OutputSink::Discard,
                capacity,
                CancellationToken::new(),
            );
            table.push(stream).map(Value::Handle)
        }
        StreamSpec::Pipe { capacity: requested } => {
            let capacity = requested.map(clamp_len).unwrap_or(capacity);
            if capacity == 0 {
                return Err(Error::detailed(
                    ErrorCode::InvalidArgument,
                    "pipe capacity must be greater than zero",
                ));
            }
            let (output, input) = OutputStream::pipe(capacity);
            let output = table.push(output)?;
            let input = table.push(input)?;
            Ok(Value::Handles(vec![output, input]))
        }
    }
}

fn input(store: &IoStore, handle: Handle) -> Result<InputStream, Error> {
    store.table().get::<InputStream>(handle).map(InputStream::clone)
}

fn output(store: &IoStore, handle: Handle) -> Result<OutputStream, Error> {
    store.table().get::<OutputStream>(handle).map(OutputStream::clone)
}

pub struct StreamsHandler;

impl StreamsHandler {
    async fn dispatch(store: Arc<IoStore>, op: BaseOp, tag: ResourceTag, call: Call) -> HandlerResult {
        match (op, tag) {
            (BaseOp::Create, ResourceTag::InputStream | ResourceTag::OutputStream) => {
                let spec = call.arg(Value::as_stream_spec, "stream spec")?;
                let expects_input = matches!(spec, StreamSpec::Bytes(_) | StreamSpec::Stdin);
                let is_pipe = matches!(spec, StreamSpec::Pipe { .. });
                if !is_pipe && expects_input != (tag == ResourceTag::InputStream) {
                    return Err(call.malformed(format!("{:?} cannot create a {}", spec, tag.name())));
                }
                Ok(create(&store, spec))
            }
            (BaseOp::Drop, ResourceTag::InputStream) => {
                let handle = call.handle()?;
                Ok(store.table().delete::<InputStream>(handle).map(|_| Value::Unit))
            }
            (BaseOp::Drop, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                Ok(store.table().delete::<OutputStream>(handle).map(|_| Value::Unit))
            }
            (BaseOp::Subscribe, ResourceTag::InputStream) => {
                let handle = call.handle()?;
                Ok(input(&store, handle)
                    .and_then(|stream| store.table().push(stream.subscribe()))
                    .map(Value::Handle))
            }
            (BaseOp::Subscribe, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                Ok(output(&store, handle)
                    .and_then(|stream| store.table().push(stream.subscribe()))
                    .map(Value::Handle))
            }

            (BaseOp::Read, ResourceTag::InputStream) => {
                let handle = call.handle()?;
                let len = call.arg(Value::as_u64, "length")?;
                Ok(input(&store, handle).and_then(|s| s.read(len)).map(Value::Bytes))
            }
            (BaseOp::BlockingRead, ResourceTag::InputStream) => {
                let handle = call.handle()?;
                let len = call.arg(Value::as_u64, "length")?;
                let stream = match input(&store, handle) {
                    Ok(stream) => stream,
                    Err(e) => return Ok(Err(e)),
                };
                Ok(stream.blocking_read(len).await.map(Value::Bytes))
            }
            (BaseOp::Skip, ResourceTag::InputStream) => {
                let handle = call.handle()?;
                let len = call.arg(Value::as_u64, "length")?;
                Ok(input(&store, handle).and_then(|s| s.skip(len)).map(Value::U64))
            }
            (BaseOp::BlockingSkip, ResourceTag::InputStream) => {
                let handle = call.handle()?;
                let len = call.arg(Value::as_u64, "length")?;
                let stream = match input(&store, handle) {
                    Ok(stream) => stream,
                    Err(e) => return Ok(Err(e)),
                };
                Ok(stream.blocking_skip(len).await.map(Value::U64))
            }

            (BaseOp::CheckWrite, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                Ok(output(&store, handle).and_then(|s| s.check_write()).map(Value::U64))
            }
            (BaseOp::Write, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                let bytes = call.arg(Value::as_bytes, "bytes")?;
                Ok(output(&store, handle).and_then(|s| s.write(&bytes)).map(|_| Value::Unit))
            }
            (BaseOp::BlockingWriteAndFlush, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                let bytes = call.arg(Value::as_bytes, "bytes")?;
                let stream = match output(&store, handle) {
                    Ok(stream) => stream,
                    Err(e) => return Ok(Err(e)),
                };
                Ok(stream.blocking_write_and_flush(&bytes).await.map(|_| Value::Unit))
            }
            (BaseOp::Flush, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                Ok(output(&store, handle).and_then(|s| s.flush()).map(|_| Value::Unit))
            }
            (BaseOp::BlockingFlush, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                let stream = match output(&store, handle) {
                    Ok(stream) => stream,
                    Err(e) => return Ok(Err(e)),
                };
                Ok(stream.blocking_flush().await.map(|_| Value::Unit))
            }
            (BaseOp::WriteZeroes, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                let len = call.arg(Value::as_u64, "length")?;
                Ok(output(&store, handle).and_then(|s| s.write_zeroes(len)).map(|_| Value::Unit))
            }
            (BaseOp::BlockingWriteZeroesAndFlush, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                let len = call.arg(Value::as_u64, "length")?;
                let stream = match output(&store, handle) {
                    Ok(stream) => stream,
                    Err(e) => return Ok(Err(e)),
                };
                Ok(stream
                    .blocking_write_zeroes_and_flush(len)
                    .await
                    .map(|_| Value::Unit))
            }
            (BaseOp::Splice, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                let (src, len) = call.arg(Value::as_handle_and_u64, "source handle and length")?;
                let streams = output(&store, handle).and_then(|dst| Ok((dst, input(&store, src)?)));
                Ok(streams
                    .and_then(|(dst, src)| dst.splice(&src, len))
                    .map(Value::U64))
            }
            (BaseOp::BlockingSplice, ResourceTag::OutputStream) => {
                let handle = call.handle()?;
                let (src, len) = call.arg(Value::as_handle_and_u64, "source handle and length")?;
                let (dst, src) =
                    match output(&store, handle).and_then(|dst| Ok((dst, input(&store, src)?))) {
                        Ok(streams) => streams,
                        Err(e) => return Ok(Err(e)),
                    };
                Ok(dst.blocking_splice(&src, len).await.map(Value::U64))
            }
            _ => Err(unsupported(op, tag)),
        }
    }
}

impl Handler for StreamsHandler {
    fn name(&self) -> &str {
        "streams"
    }

    fn tags(&self) -> &'static [ResourceTag] {
        &[ResourceTag::InputStream, ResourceTag::OutputStream]
    }

    fn handle(
        &self,
        store: Arc<IoStore>,
        op: BaseOp,
        tag: ResourceTag,
        call: Call,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin(Self::dispatch(store, op, tag, call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_stream_reads_then_closes() {
        let stream = InputStream::from_bytes(b"hello".to_vec());
        assert_eq!(stream.read(3).unwrap(), b"hel");
        assert_eq!(stream.read(10).unwrap(), b"lo");
        assert!(stream.read(1).unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_empty_pipe_read_would_block_and_zero_read_is_empty() {
        let (_output, input) = OutputStream::pipe(16);
        let err = input.read(4).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::WouldBlock));
        assert_eq!(input.read(0).unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_write_beyond_permit_is_invalid_argument() {
        let (output, input) = OutputStream::pipe(4);
        assert_eq!(output.check_write().unwrap(), 4);
        let err = output.write(b"too long").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));

        output.write(b"abcd").unwrap();
        assert_eq!(output.check_write().unwrap(), 0);
        assert_eq!(input.read(2).unwrap(), b"ab");
        assert_eq!(output.check_write().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_closing_input_fails_writer_with_closed() {
        let (output, input) = OutputStream::pipe(8);
        input.close();
        assert!(output.check_write().unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_closing_output_drains_then_ends() {
        let (output, input) = OutputStream::pipe(8);
        output.write(b"bye").unwrap();
        output.close();
        assert_eq!(input.blocking_read(8).await.unwrap(), b"bye");
        assert!(input.blocking_read(8).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_close() {
        let (_output, input) = OutputStream::pipe(8);
        let reader = {
            let input = input.clone();
            tokio::spawn(async move { input.blocking_read(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        input.close();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("blocked reader was not woken")
            .unwrap();
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_blocking_write_larger_than_capacity() {
        let (output, input) = OutputStream::pipe(4);
        let reader = tokio::spawn(async move {
            let mut collected = Vec::new();
            while collected.len() < 10 {
                collected.extend(input.blocking_read(3).await.unwrap());
            }
            collected
        });
        output.blocking_write_and_flush(b"0123456789").await.unwrap();
        assert_eq!(reader.await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_splice_moves_available_bytes() {
        let src = InputStream::from_bytes(b"spliced".to_vec());
        let (dst, sink) = OutputStream::pipe(4);
        assert_eq!(dst.splice(&src, 100).unwrap(), 4);
        assert_eq!(sink.read(10).unwrap(), b"spli");
        assert_eq!(dst.blocking_splice(&src, 100).await.unwrap(), 3);
        assert_eq!(sink.read(10).unwrap(), b"ced");
        assert!(dst.splice(&src, 1).unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_source_failure_is_last_operation_failed_once() {
        let (_output, input) = OutputStream::pipe(8);
        input.pipe.update(|state| {
            state.source_failed(IoError::new(ErrorCode::ConnectionReset, "reset by peer"))
        });
        let err = input.read(1).unwrap_err();
        assert_eq!(err.kind(), "last-operation-failed");
        assert!(input.read(1).unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_splice_propagates_source_failure() {
        let (_feed, src) = OutputStream::pipe(8);
        src.pipe.update(|state| {
            state.source_failed(IoError::new(ErrorCode::ConnectionReset, "reset by peer"))
        });
        let (dst, _reader) = OutputStream::pipe(8);

        let err = dst.splice(&src, 4).unwrap_err();
        assert_eq!(err.kind(), "last-operation-failed");
        assert_eq!(err.detail(), Some("connection-reset: reset by peer".to_string()));
        assert!(dst.splice(&src, 4).unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_write_zeroes_is_bounded_by_permit() {
        let (output, input) = OutputStream::pipe(16);
        let err = output.write_zeroes(u64::MAX).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
        assert_eq!(output.write_zeroes(17).unwrap_err().code(), Some(ErrorCode::InvalidArgument));

        output.write_zeroes(5).unwrap();
        assert_eq!(input.read(16).unwrap(), vec![0u8; 5]);
    }

    #[tokio::test]
    async fn test_blocking_write_zeroes_in_permit_sized_chunks() {
        let (output, input) = OutputStream::pipe(4);
        let reader = tokio::spawn(async move {
            let mut collected = Vec::new();
            while collected.len() < 10 {
                collected.extend(input.blocking_read(3).await.unwrap());
            }
            collected
        });
        output.blocking_write_zeroes_and_flush(10).await.unwrap();
        assert_eq!(reader.await.unwrap(), vec![0u8; 10]);
    }

    #[tokio::test]
    async fn test_discard_sink_accepts_and_flushes() {
        let output = OutputStream::spawn_writer(
            tokio::io::sink(),
            OutputSink::Discard,
            16,
            CancellationToken::new(),
        );
        output.blocking_write_and_flush(&[7u8; 100]).await.unwrap();
        output.blocking_flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_tracks_readability() {
        let (output, input) = OutputStream::pipe(8);
        let readable = input.subscribe();
        assert!(!readable.is_ready());
        output.write(b"x").unwrap();
        assert!(readable.is_ready());
        assert!(output.subscribe().is_ready());
    }
}
