use crate::registry::{ProcessRegistry, RecordKey};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Splits child output into lines
///
/// Invalid UTF-8 is replaced rather than rejected so one bad byte cannot end the
/// capture. A trailing `\r` is stripped; an unterminated last line is emitted at EOF.
#[derive(Debug, Default)]
pub struct CaptureLineCodec {
    scanned: usize,
}

impl CaptureLineCodec {
    fn take_line(src: &mut BytesMut, len: usize, consumed: usize) -> String {
        let mut end = len;
        if end > 0 && src[end - 1] == b'\r' {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&src[..end]).into_owned();
        src.advance(consumed);
        line
    }
}

impl Decoder for CaptureLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = self.scanned + offset;
                self.scanned = 0;
                Ok(Some(Self::take_line(src, newline, newline + 1)))
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let len = src.len();
        Ok(Some(Self::take_line(src, len, len)))
    }
}

/// How a capture ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The child closed its end of the pipe
    Eof,
    /// Teardown asked the collector to stop
    Cancelled,
    /// A read failed; the record is marked capture-closed
    Closed,
    /// The record disappeared while capturing
    Orphaned,
}

/// Drains one child's stdout into its [`ProcessRecord`](crate::ProcessRecord)
pub struct OutputCollector {
    registry: Arc<ProcessRegistry>,
    key: RecordKey,
}

impl OutputCollector {
    pub fn new(registry: Arc<ProcessRegistry>, key: RecordKey) -> Self {
        Self { registry, key }
    }

    /// Read lines from `reader` until EOF, cancellation or a read error
    pub async fn drain<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        cancel: &CancellationToken,
    ) -> CaptureOutcome {
        let mut frames = FramedRead::with_capacity(reader, CaptureLineCodec::default(), 1024);
        debug!(identifier = %self.key.identifier, "Output capture started");

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(identifier = %self.key.identifier, "Output capture cancelled");
                    return CaptureOutcome::Cancelled;
                }
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(line)) => {
                    if !self.registry.append_line(&self.key, line) {
                        debug!(identifier = %self.key.identifier, "Record gone, dropping output");
                        return CaptureOutcome::Orphaned;
                    }
                }
                Some(Err(e)) => {
                    warn!(identifier = %self.key.identifier, error = %e, "Output capture closed after read error");
                    self.registry.mark_capture_closed(&self.key);
                    return CaptureOutcome::Closed;
                }
                None => {
                    debug!(identifier = %self.key.identifier, "Output capture reached EOF");
                    return CaptureOutcome::Eof;
                }
            }
        }
    }
}
