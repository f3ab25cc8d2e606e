//! gRPC job submission glue.
//!
//! RPC schema source: `proto/gqd_job.proto`.
//!
//! `JobService.Submit` takes one [`v1::JobRequest`] and answers with a server
//! stream of [`v1::JobResponse`] frames for that job. The stream ends when the
//! partition finished; a `Status` item is a mid-execution failure.

use futures::StreamExt;
use gqd_common::{GqdError, Result};
use tokio::sync::Mutex;
use tonic::async_trait;
use tonic::transport::Channel;
use tracing::debug;

use crate::channel::{ClusterChannel, ResultStream};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("gqd.job.v1");
}

pub use v1::job_service_client::JobServiceClient;
pub use v1::job_service_server::{JobService, JobServiceServer};

/// Cluster channel backed by one tonic client per endpoint.
pub struct GrpcClusterChannel {
    endpoint: String,
    client: Mutex<JobServiceClient<Channel>>,
}

impl GrpcClusterChannel {
    /// Connect to a worker endpoint such as `http://10.0.0.5:1234`.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = JobServiceClient::connect(endpoint.to_string())
            .await
            .map_err(map_transport_err)?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client: Mutex::new(client),
        })
    }
}

#[async_trait]
impl ClusterChannel for GrpcClusterChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn submit(&self, request: v1::JobRequest) -> Result<ResultStream> {
        let job_id = request.conf.as_ref().map(|c| c.job_id).unwrap_or_default();
        let mut client = self.client.lock().await;
        let response = client.submit(request).await.map_err(map_submit_err)?;
        debug!(endpoint = %self.endpoint, job_id, "job accepted by endpoint");
        let frames = response
            .into_inner()
            .map(|item| item.map_err(map_stream_err));
        Ok(Box::pin(frames))
    }
}

fn map_submit_err(err: tonic::Status) -> GqdError {
    GqdError::Submission(format!("grpc submit failed: {err}"))
}

fn map_stream_err(err: tonic::Status) -> GqdError {
    GqdError::Stream(format!("grpc result stream failed: {}", err.message()))
}

fn map_transport_err(err: tonic::transport::Error) -> GqdError {
    GqdError::Submission(format!("grpc connect failed: {err}"))
}
