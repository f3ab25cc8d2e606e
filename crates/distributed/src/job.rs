//! Job descriptor assembly.
//!
//! A [`JobDescriptor`] is the complete, immutable submission record of one
//! job: the compiled plan request plus the cluster constraints from the
//! configuration snapshot and a freshly issued [`JobId`].

use gqd_common::{ClusterConfig, DispatchConfig, GqdError, JobId, JobIdAllocator, Result};
use prost::Message;

use crate::grpc::v1;

/// Fully populated job submission record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    job_id: JobId,
    job_name: String,
    conf: v1::JobConfig,
    request: v1::JobRequest,
}

impl JobDescriptor {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn workers(&self) -> u32 {
        self.conf().workers
    }

    pub fn batch_size(&self) -> u32 {
        self.conf().batch_size
    }

    pub fn memory_limit(&self) -> u64 {
        self.conf().memory_limit
    }

    pub fn output_capacity(&self) -> u32 {
        self.conf().output_capacity
    }

    /// Cluster-side time limit hint in milliseconds.
    pub fn time_limit(&self) -> u64 {
        self.conf().time_limit
    }

    pub fn servers(&self) -> &[u64] {
        &self.conf().servers
    }

    /// Wire request sent to every cluster endpoint.
    pub fn request(&self) -> &v1::JobRequest {
        &self.request
    }

    fn conf(&self) -> &v1::JobConfig {
        &self.conf
    }
}

/// Turns compiled plan bytes into [`JobDescriptor`]s for one configuration snapshot.
#[derive(Debug, Clone)]
pub struct JobDescriptorBuilder {
    cluster: ClusterConfig,
    job_name_prefix: String,
    servers: Vec<u64>,
}

impl JobDescriptorBuilder {
    /// Fails with [`GqdError::InvalidConfig`] when the snapshot would produce an
    /// incomplete descriptor.
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        config.cluster.validate()?;
        if config.job_name_prefix.is_empty() {
            return Err(GqdError::InvalidConfig(
                "job_name_prefix must not be empty".to_string(),
            ));
        }
        let servers = (0..config.cluster.server_count() as u64).collect();
        Ok(Self {
            cluster: config.cluster.clone(),
            job_name_prefix: config.job_name_prefix.clone(),
            servers,
        })
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Decode `plan` as a job request and stamp it with a new id and the
    /// configured constraints.
    ///
    /// The id is drawn only after the plan decoded, so a malformed plan never
    /// consumes one.
    pub fn build(&self, plan: &[u8], ids: &JobIdAllocator) -> Result<JobDescriptor> {
        if plan.is_empty() {
            return Err(GqdError::MalformedPlan("plan is empty".to_string()));
        }
        let mut request = v1::JobRequest::decode(plan)
            .map_err(|e| GqdError::MalformedPlan(format!("plan is not a job request: {e}")))?;
        if request.plan.is_empty() {
            return Err(GqdError::MalformedPlan(
                "job request carries no operator plan".to_string(),
            ));
        }

        let job_id = ids.next();
        let job_name = format!("{}_{}", self.job_name_prefix, job_id);
        let conf = v1::JobConfig {
            job_id: job_id.0,
            job_name: job_name.clone(),
            workers: self.cluster.worker_num,
            time_limit: self.cluster.time_limit_ms,
            batch_size: self.cluster.batch_size,
            output_capacity: self.cluster.output_capacity,
            memory_limit: self.cluster.memory_limit,
            servers: self.servers.clone(),
        };
        request.conf = Some(conf.clone());
        Ok(JobDescriptor {
            job_id,
            job_name,
            conf,
            request,
        })
    }
}
