//! Trace buffer
//!
//! Collects job output and streams it to the orchestrator as
//! `Content-Range` appends. The whole trace is kept locally so the final
//! checksum covers every byte and a 416 can be answered by resending from
//! the offset the server reports.

use conduit_client::{ClientError, ConduitClient, TraceAppend};
use conduit_core::domain::trace::TraceChecksum;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Largest slice sent in one PATCH
const MAX_APPEND_SIZE: usize = 128 * 1024;

/// Range mismatches tolerated per flush before giving up until the next one
const MAX_RESYNCS: usize = 5;

#[derive(Debug, Default)]
struct TraceState {
    data: Vec<u8>,
    /// Bytes the orchestrator acknowledged
    sent: u64,
}

#[derive(Debug, Default)]
pub struct TraceBuffer {
    state: Mutex<TraceState>,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, bytes: &[u8]) {
        self.state.lock().await.data.extend_from_slice(bytes);
    }

    /// Append a line of runner output, e.g. the command being run
    pub async fn line(&self, line: impl AsRef<str>) {
        let mut state = self.state.lock().await;
        state.data.extend_from_slice(line.as_ref().as_bytes());
        state.data.push(b'\n');
    }

    /// `sha256:<hex>` over everything appended so far
    pub async fn checksum(&self) -> String {
        TraceChecksum::of(&self.state.lock().await.data)
    }

    /// Send everything not yet acknowledged
    ///
    /// Fails with [`ClientError::JobNotRunning`] once the job was canceled or
    /// finished on the server.
    pub async fn flush(&self, client: &ConduitClient, job_id: i64, token: &str) -> Result<(), ClientError> {
        let mut resyncs = 0;

        loop {
            let (offset, chunk) = {
                let state = self.state.lock().await;
                let start = state.sent as usize;
                if start >= state.data.len() {
                    return Ok(());
                }
                let end = state.data.len().min(start + MAX_APPEND_SIZE);
                (state.sent, state.data[start..end].to_vec())
            };

            let appended = client.append_trace(job_id, token, offset, chunk).await?;
            let mut state = self.state.lock().await;
            let stream_size = appended.stream_size().min(state.data.len() as u64);

            match appended {
                TraceAppend::Accepted { .. } => {
                    debug!(job_id, stream_size, "Trace appended");
                    state.sent = stream_size;
                }
                TraceAppend::RangeMismatch { .. } => {
                    resyncs += 1;
                    warn!(
                        job_id,
                        offset, stream_size, "Trace range rejected, resending from server offset"
                    );
                    state.sent = stream_size;
                    if resyncs >= MAX_RESYNCS {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
impl TraceBuffer {
    pub async fn contents(&self) -> Vec<u8> {
        self.state.lock().await.data.clone()
    }

    pub async fn is_flushed(&self) -> bool {
        let state = self.state.lock().await;
        state.sent as usize >= state.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_collects_output() {
        let trace = TraceBuffer::new();
        trace.line("$ make").await;
        trace.append(b"ok\n").await;

        assert_eq!(trace.contents().await, b"$ make\nok\n");
        assert_eq!(trace.checksum().await, TraceChecksum::of(b"$ make\nok\n"));
        assert!(!trace.is_flushed().await);
    }

    #[tokio::test]
    async fn test_empty_buffer_is_flushed() {
        let trace = TraceBuffer::new();
        assert!(trace.is_flushed().await);

        // Nothing to send, so no request is made
        let client = ConduitClient::new("http://127.0.0.1:9");
        assert!(trace.flush(&client, 1, "token").await.is_ok());
    }
}
