//! Cluster channel contract and the in-process adapter.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;

use futures::Stream;
use gqd_common::{GqdError, Result};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::async_trait;

use crate::grpc::v1;

/// Result frames of one job partition, in arrival order.
///
/// The stream ends when the partition finished; an `Err` item is a
/// mid-execution failure and no further items follow it.
pub type ResultStream = Pin<Box<dyn Stream<Item = Result<v1::JobResponse>> + Send>>;

/// Connection to one cluster endpoint.
#[async_trait]
pub trait ClusterChannel: Send + Sync {
    fn endpoint(&self) -> &str;
    /// Hand a job to the endpoint. Returns as soon as the job is accepted;
    /// results arrive on the returned stream.
    async fn submit(&self, request: v1::JobRequest) -> Result<ResultStream>;
}

#[derive(Default)]
struct InProcessState {
    reject: Option<String>,
    submitted: Vec<v1::JobRequest>,
    feeds: HashMap<u64, mpsc::UnboundedSender<Result<v1::JobResponse>>>,
}

/// Channel whose "cluster" is driven by the caller.
///
/// Records submitted requests and lets the caller push frames, fail or finish
/// a job, or reject submissions outright.
#[derive(Default)]
pub struct InProcessChannel {
    endpoint: String,
    state: Mutex<InProcessState>,
}

impl InProcessChannel {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(InProcessState::default()),
        }
    }

    /// Fail every following submission with `reason`.
    pub fn reject_with(&self, reason: impl Into<String>) {
        self.lock().reject = Some(reason.into());
    }

    pub fn submitted(&self) -> Vec<v1::JobRequest> {
        self.lock().submitted.clone()
    }

    /// Whether a job still has an open result stream.
    pub fn is_streaming(&self, job_id: u64) -> bool {
        self.lock().feeds.contains_key(&job_id)
    }

    /// Emit one frame for `job_id`. Returns `false` when the job has no open stream.
    pub fn push_frame(&self, job_id: u64, data: impl Into<Vec<u8>>) -> bool {
        self.push_frame_as(job_id, job_id, data)
    }

    /// Emit a frame on `job_id`'s stream that claims to belong to `claimed_job_id`.
    pub fn push_frame_as(&self, job_id: u64, claimed_job_id: u64, data: impl Into<Vec<u8>>) -> bool {
        let frame = v1::JobResponse {
            job_id: claimed_job_id,
            data: data.into(),
        };
        self.lock()
            .feeds
            .get(&job_id)
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    /// End `job_id`'s stream with a failure.
    pub fn fail(&self, job_id: u64, message: impl Into<String>) -> bool {
        match self.lock().feeds.remove(&job_id) {
            Some(tx) => tx.send(Err(GqdError::Stream(message.into()))).is_ok(),
            None => false,
        }
    }

    /// End `job_id`'s stream normally.
    pub fn finish(&self, job_id: u64) -> bool {
        self.lock().feeds.remove(&job_id).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InProcessState> {
        self.state.lock().expect("in-process channel lock poisoned")
    }
}

#[async_trait]
impl ClusterChannel for InProcessChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn submit(&self, request: v1::JobRequest) -> Result<ResultStream> {
        let mut state = self.lock();
        if let Some(reason) = &state.reject {
            return Err(GqdError::Submission(format!(
                "{} rejected job: {reason}",
                self.endpoint
            )));
        }
        let job_id = request
            .conf
            .as_ref()
            .map(|c| c.job_id)
            .ok_or_else(|| GqdError::Submission("job request has no config".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.feeds.insert(job_id, tx);
        state.submitted.push(request);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn request(job_id: u64) -> v1::JobRequest {
        v1::JobRequest {
            conf: Some(v1::JobConfig {
                job_id,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn frames_then_finish_end_the_stream() {
        let channel = InProcessChannel::new("inproc-0");
        let mut stream = channel.submit(request(7)).await.expect("submit");
        assert!(channel.push_frame(7, b"[1]".to_vec()));
        assert!(!channel.push_frame(8, b"[2]".to_vec()));
        assert!(channel.finish(7));
        assert!(!channel.is_streaming(7));

        let frame = stream.next().await.expect("frame").expect("ok frame");
        assert_eq!((frame.job_id, frame.data), (7, b"[1]".to_vec()));
        assert!(stream.next().await.is_none());
        assert_eq!(channel.submitted().len(), 1);
    }

    #[tokio::test]
    async fn failure_is_last_item_and_rejection_records_nothing() {
        let channel = InProcessChannel::new("inproc-0");
        let mut stream = channel.submit(request(1)).await.expect("submit");
        assert!(channel.fail(1, "worker lost"));
        let err = stream.next().await.expect("item").expect_err("failure");
        assert!(err.to_string().contains("worker lost"));
        assert!(stream.next().await.is_none());

        channel.reject_with("maintenance");
        let err = match channel.submit(request(2)).await {
            Ok(_) => panic!("submission should be rejected"),
            Err(e) => e,
        };
        assert!(matches!(err, GqdError::Submission(_)));
        assert_eq!(channel.submitted().len(), 1);
    }
}
