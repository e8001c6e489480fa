//! Live upload of the session record
//!
//! While the host records, record bytes are compressed as they arrive and
//! posted in blocks to the stream address the league handed out. Each post
//! names the offset of its first byte in the compressed stream and whether
//! it is the last block, so the receiving end can stitch the blocks back
//! together. A failed post is simply repeated from the same offset.

use crate::error::StreamError;
use log::{debug, info, warn};
use std::io::Write;
use std::time::{Duration, Instant};
use zstd::stream::write::Encoder;

pub const MIN_BLOCK_SIZE: usize = 10 * 1024;
pub const MAX_BLOCK_SIZE: usize = 20 * 1024;
pub const STREAM_INTERVAL: Duration = Duration::from_secs(30);

const COMPRESSION_LEVEL: i32 = 9;

/// Upload side of a record stream, usually an HTTP client
///
/// Posts are asynchronous: `post` starts one, `is_busy` reports whether it
/// is still running and `poll_result` hands out its outcome once.
pub trait StreamSink {
    fn post(&mut self, address: &str, position: u64, end: bool, data: &[u8])
        -> Result<(), StreamError>;
    fn is_busy(&self) -> bool;
    fn poll_result(&mut self) -> Option<Result<(), StreamError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// A running record posts nothing smaller than this
    pub min_block: usize,
    /// Compression pauses while this much is unsent
    pub max_block: usize,
    /// Minimum time between two posts of a running record
    pub interval: Duration,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            min_block: MIN_BLOCK_SIZE,
            max_block: MAX_BLOCK_SIZE,
            interval: STREAM_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Record bytes handed in but not compressed yet
    pub waiting: usize,
    /// Record bytes compressed so far
    pub bytes_in: u64,
    /// Compressed bytes the server has not confirmed
    pub pending: usize,
    /// Compressed bytes the server confirmed
    pub sent: u64,
    pub failed_posts: u32,
}

pub struct RecordStreamer {
    address: String,
    sink: Box<dyn StreamSink>,
    limits: StreamLimits,
    /// Gone once the record finished
    encoder: Option<Encoder<'static, Vec<u8>>>,
    waiting: Vec<u8>,
    pending: Vec<u8>,
    in_flight: Option<usize>,
    last_attempt: Option<Instant>,
    bytes_in: u64,
    sent: u64,
    failed_posts: u32,
    done: bool,
}

impl RecordStreamer {
    pub fn start(
        address: impl Into<String>,
        sink: Box<dyn StreamSink>,
        limits: StreamLimits,
        now: Instant,
    ) -> Result<Self, StreamError> {
        let encoder = Encoder::new(Vec::new(), COMPRESSION_LEVEL)?;
        let address = address.into();
        info!("Streaming record to {}", address);
        Ok(Self {
            address,
            sink,
            limits,
            encoder: Some(encoder),
            waiting: Vec::new(),
            pending: Vec::new(),
            in_flight: None,
            last_attempt: Some(now),
            bytes_in: 0,
            sent: 0,
            failed_posts: 0,
            done: false,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The record ended and only the remainder is left to post
    pub fn is_finishing(&self) -> bool {
        self.encoder.is_none()
    }

    /// Everything was posted and confirmed
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            waiting: self.waiting.len(),
            bytes_in: self.bytes_in,
            pending: self.pending.len(),
            sent: self.sent,
            failed_posts: self.failed_posts,
        }
    }

    /// Hands new record bytes to the compressor
    pub fn stream_in(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.encoder.is_none() {
            return Err(StreamError::Finished);
        }
        self.waiting.extend_from_slice(data);
        self.compress_waiting()
    }

    fn compress_waiting(&mut self) -> Result<(), StreamError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        if self.waiting.is_empty() || self.pending.len() >= self.limits.max_block {
            return Ok(());
        }
        encoder.write_all(&self.waiting)?;
        encoder.flush()?;
        self.bytes_in += self.waiting.len() as u64;
        self.waiting.clear();
        self.pending.append(encoder.get_mut());
        Ok(())
    }

    /// Compresses the rest of the record and asks for an immediate post
    pub fn finish(&mut self) -> Result<(), StreamError> {
        let Some(mut encoder) = self.encoder.take() else {
            return Ok(());
        };
        encoder.write_all(&self.waiting)?;
        self.bytes_in += self.waiting.len() as u64;
        self.waiting.clear();
        let rest = encoder.finish()?;
        self.pending.extend_from_slice(&rest);
        self.last_attempt = None;
        debug!("Record finished, {} bytes left to stream", self.pending.len());
        Ok(())
    }

    /// Collects the last post's outcome and starts the next one when due
    ///
    /// Returns whether a post was started.
    pub fn stream_out(&mut self, now: Instant) -> bool {
        if self.done || self.sink.is_busy() {
            return false;
        }

        if let Some(amount) = self.in_flight.take() {
            match self.sink.poll_result() {
                Some(Ok(())) => {
                    self.pending.drain(..amount);
                    self.sent += amount as u64;
                    debug!("Streamed {} bytes, {} in total", amount, self.sent);
                }
                Some(Err(e)) => {
                    warn!("Record stream post at {} failed: {}", self.sent, e);
                    self.failed_posts += 1;
                }
                None => {
                    warn!("Record stream post at {} ended without a result", self.sent);
                    self.failed_posts += 1;
                }
            }
            if let Err(e) = self.compress_waiting() {
                warn!("Record compression failed: {}", e);
            }
        }

        if self.encoder.is_some() {
            if self.pending.len() < self.limits.min_block {
                return false;
            }
            if self
                .last_attempt
                .is_some_and(|at| now.saturating_duration_since(at) < self.limits.interval)
            {
                return false;
            }
        } else if self.pending.is_empty() {
            info!("Record stream complete, {} bytes sent", self.sent);
            self.done = true;
            return false;
        }

        let end = self.encoder.is_none();
        self.last_attempt = Some(now);
        match self.sink.post(&self.address, self.sent, end, &self.pending) {
            Ok(()) => {
                self.in_flight = Some(self.pending.len());
                true
            }
            Err(e) => {
                warn!("Record stream post refused: {}", e);
                self.failed_posts += 1;
                false
            }
        }
    }

    /// Drops the stream and gives the sink back
    pub fn stop(self) -> Box<dyn StreamSink> {
        if !self.done {
            info!(
                "Record stream to {} stopped with {} bytes unsent",
                self.address,
                self.pending.len() + self.waiting.len()
            );
        }
        self.sink
    }
}
