//! Ingestion of client bytes into an upload.
//!
//! Input is cut into slices of the planned part size and every slice is
//! committed as one part before the next one is read. Both entry points (a
//! stream of chunks and an async reader) go through the same loop.
//!
//! Cancellation is observed between slices only: a part whose transfer has
//! started is always committed and persisted before the call returns, so the
//! record never trails the backend by a half-committed part. A cancelled call
//! reports the bytes it did accept with [`WriteStatus::Cancelled`]. Any other
//! failure ends the call with an error and drops the input source.

use crate::{
    models::upload::UploadRecord,
    services::{
        coordinator::MultipartCoordinator,
        error::{StoreError, StoreResult},
        part_size::{PartSizeLimits, optimal_part_size},
    },
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a write call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// The input ran dry before the upload was complete.
    Drained,
    /// Every declared byte is committed and the object is assembled.
    Completed,
    /// Cancellation was observed; the reported bytes were committed.
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes accepted by this call.
    pub bytes_written: u64,
    /// Upload offset after this call.
    pub offset: u64,
    pub status: WriteStatus,
}

/// Source of slices. An empty slice means the input is exhausted; a short
/// non-empty slice does not.
#[async_trait]
pub trait SliceSource: Send {
    async fn read_slice(&mut self, max: usize) -> io::Result<Bytes>;
}

/// Slices a stream of chunks, carrying over what did not fit.
pub struct StreamSource<S> {
    stream: S,
    pending: Bytes,
    exhausted: bool,
}

impl<S> StreamSource<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
            exhausted: false,
        }
    }
}

#[async_trait]
impl<S> SliceSource for StreamSource<S>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
{
    async fn read_slice(&mut self, max: usize) -> io::Result<Bytes> {
        let mut slice = BytesMut::new();
        while slice.len() < max {
            if self.pending.is_empty() {
                if self.exhausted {
                    break;
                }
                match self.stream.next().await {
                    Some(chunk) => self.pending = chunk?,
                    None => {
                        self.exhausted = true;
                        break;
                    }
                }
            }
            let take = (max - slice.len()).min(self.pending.len());
            slice.extend_from_slice(&self.pending.split_to(take));
        }
        Ok(slice.freeze())
    }
}

/// Slices an async reader.
pub struct ReaderSource<R> {
    reader: R,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> SliceSource for ReaderSource<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn read_slice(&mut self, max: usize) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        (&mut self.reader).take(max as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[derive(Clone)]
pub struct IngestionPipeline {
    coordinator: MultipartCoordinator,
    limits: PartSizeLimits,
}

impl IngestionPipeline {
    pub fn new(coordinator: MultipartCoordinator, limits: PartSizeLimits) -> Self {
        Self {
            coordinator,
            limits,
        }
    }

    /// Append the contents of a chunk stream to upload `id`.
    pub async fn write_stream<S>(
        &self,
        id: &str,
        stream: S,
        cancel: &CancellationToken,
    ) -> StoreResult<WriteOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        self.ingest(id, StreamSource::new(stream), cancel).await
    }

    /// Append everything `reader` yields to upload `id`.
    pub async fn write_reader<R>(
        &self,
        id: &str,
        reader: R,
        cancel: &CancellationToken,
    ) -> StoreResult<WriteOutcome>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.ingest(id, ReaderSource::new(reader), cancel).await
    }

    /// Drive `source` into upload `id`. Takes the source by value so it is
    /// released as soon as the call ends, whatever the outcome.
    pub async fn ingest<S: SliceSource>(
        &self,
        id: &str,
        mut source: S,
        cancel: &CancellationToken,
    ) -> StoreResult<WriteOutcome> {
        let mut record = self.coordinator.state().get(id).await?;

        if record.is_complete() {
            // a previous call may have lost the finalize response
            self.coordinator.finalize(&record).await?;
            return Ok(WriteOutcome {
                bytes_written: 0,
                offset: record.offset,
                status: WriteStatus::Completed,
            });
        }

        let part_size = optimal_part_size(record.length(), &self.limits);
        let result = self
            .drain(&mut record, &mut source, part_size, cancel)
            .await;
        if let Err(err) = &result {
            warn!(id, offset = record.offset, error = %err, "write aborted, releasing input");
        }
        result
    }

    async fn drain<S: SliceSource>(
        &self,
        record: &mut UploadRecord,
        source: &mut S,
        part_size: u64,
        cancel: &CancellationToken,
    ) -> StoreResult<WriteOutcome> {
        let start = record.offset;
        let outcome = |record: &UploadRecord, status| WriteOutcome {
            bytes_written: record.offset - start,
            offset: record.offset,
            status,
        };

        loop {
            if cancel.is_cancelled() {
                info!(id = %record.id, offset = record.offset, "write cancelled");
                return Ok(outcome(record, WriteStatus::Cancelled));
            }

            // one byte past the remainder is enough to detect an overrun
            let want = match record.remaining() {
                Some(remaining) => part_size.min(remaining + 1),
                None => part_size,
            };
            let slice = source
                .read_slice(usize::try_from(want).unwrap_or(usize::MAX))
                .await?;
            if slice.is_empty() {
                break;
            }

            let read = slice.len() as u64;
            if let Some(length) = record.length() {
                if record.offset + read > length {
                    return Err(StoreError::ClientOverrun {
                        id: record.id.clone(),
                        offset: record.offset,
                        length,
                        attempted: read,
                    });
                }
            }

            self.coordinator.upload_part(record, slice, None).await?;
            if record.is_complete() {
                self.coordinator.finalize(record).await?;
            }
        }

        let status = if record.is_complete() {
            WriteStatus::Completed
        } else {
            WriteStatus::Drained
        };
        debug!(id = %record.id, offset = record.offset, ?status, "write finished");
        Ok(outcome(record, status))
    }
}
