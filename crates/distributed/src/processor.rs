//! Operation dispatch pipeline.
//!
//! [`DispatchOpProcessor::dispatch`] runs one client operation through:
//! op kind check -> decode -> optimize -> metadata refresh -> compile ->
//! descriptor build (job id issued here) -> broadcast with a fresh [`ResultSink`].
//!
//! Every stage up to submission runs inline in the calling task. A failure at
//! any stage is written to the session as exactly one terminal response and
//! returned to the caller; nothing is retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use gqd_common::{
    global_metrics, DispatchConfig, GqdError, JobIdAllocator, Result, SessionConcurrency,
};
use gqd_planner::{
    DefaultResultAnalyzer, FileMetaFetcher, FrontEnd, MetaFetcher, Payload, PlanCompiler,
    ResultAnalyzer, ResultParser, SharedSchema, TraversalFrontEnd,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::broadcast::{ClusterBroadcaster, JobHandle};
use crate::channel::ClusterChannel;
use crate::compiler::IrPlanCompiler;
use crate::job::{JobDescriptor, JobDescriptorBuilder};
use crate::session::{ResponseMessage, Session};
use crate::sink::{ResultEnricher, ResultSink};

pub const OP_BYTECODE: &str = "bytecode";
pub const OP_EVAL: &str = "eval";

/// One client operation as received from the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRequest {
    pub request_id: String,
    /// Operation kind tag, e.g. `bytecode` or `eval`.
    pub op: String,
    pub payload: Vec<u8>,
}

impl OpRequest {
    pub fn new(request_id: impl Into<String>, op: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            request_id: request_id.into(),
            op: op.into(),
            payload,
        }
    }
}

/// Operation kinds the dispatcher distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Execute(Payload),
    Unsupported(String),
}

impl Operation {
    /// Classify an op tag. Fails only for an `eval` payload that is not UTF-8.
    pub fn parse(op: &str, payload: &[u8]) -> Result<Self> {
        match op {
            OP_BYTECODE => Ok(Operation::Execute(Payload::Bytecode(payload.to_vec()))),
            OP_EVAL => String::from_utf8(payload.to_vec())
                .map(|script| Operation::Execute(Payload::Script(script)))
                .map_err(|e| GqdError::Planning(format!("eval script is not UTF-8: {e}"))),
            other => Ok(Operation::Unsupported(other.to_string())),
        }
    }
}

/// External collaborators of the dispatch pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub front_end: Arc<dyn FrontEnd>,
    pub meta_fetcher: Arc<dyn MetaFetcher>,
    pub compiler: Arc<dyn PlanCompiler>,
    pub analyzer: Arc<dyn ResultAnalyzer>,
    pub enricher: Option<Arc<dyn ResultEnricher>>,
}

impl Collaborators {
    /// Default wiring: traversal front end, schema re-read from `schema_path`
    /// on every dispatch, IR plan compiler and JSON result decoding.
    pub fn with_schema_file(schema_path: impl Into<std::path::PathBuf>) -> Self {
        let schema = SharedSchema::new();
        Self {
            front_end: Arc::new(TraversalFrontEnd::new()),
            meta_fetcher: Arc::new(FileMetaFetcher::new(schema_path, schema.clone())),
            compiler: Arc::new(IrPlanCompiler::new(schema)),
            analyzer: Arc::new(DefaultResultAnalyzer),
            enricher: None,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn ResultEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }
}

pub struct DispatchOpProcessor {
    collaborators: Collaborators,
    builder: JobDescriptorBuilder,
    broadcaster: ClusterBroadcaster,
    ids: Arc<JobIdAllocator>,
    concurrency: SessionConcurrency,
    session_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl DispatchOpProcessor {
    pub fn new(
        config: &DispatchConfig,
        collaborators: Collaborators,
        channels: Vec<Arc<dyn ClusterChannel>>,
        ids: Arc<JobIdAllocator>,
    ) -> Result<Self> {
        Ok(Self {
            collaborators,
            builder: JobDescriptorBuilder::new(config)?,
            broadcaster: ClusterBroadcaster::new(channels, config.sink_buffer_frames)?,
            ids,
            concurrency: config.session_concurrency,
            session_slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn broadcaster(&self) -> &ClusterBroadcaster {
        &self.broadcaster
    }

    /// Run `request` through the pipeline and submit its job.
    ///
    /// Returns once the job is submitted; results are written to `session`
    /// asynchronously. On failure the session has already received the error
    /// response.
    pub async fn dispatch(
        &self,
        request: OpRequest,
        session: Arc<dyn Session>,
    ) -> Result<JobHandle> {
        let started = Instant::now();
        let result = match Operation::parse(&request.op, &request.payload) {
            Ok(Operation::Execute(payload)) => {
                self.execute(&request, payload, Arc::clone(&session)).await
            }
            Ok(Operation::Unsupported(tag)) => Err(report(
                &request,
                session.as_ref(),
                GqdError::Unsupported(format!("{tag} is unsupported")),
            )),
            Err(err) => Err(report(&request, session.as_ref(), err)),
        };
        let outcome = match &result {
            Ok(_) => "submitted",
            Err(err) => error_kind(err),
        };
        global_metrics().record_dispatch(
            op_label(&request.op),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Cancel every in-flight job and stop accepting new ones.
    pub async fn close(&self) -> usize {
        self.broadcaster.close().await
    }

    async fn execute(
        &self,
        request: &OpRequest,
        payload: Payload,
        session: Arc<dyn Session>,
    ) -> Result<JobHandle> {
        let prepared = self
            .acquire_session_slot(session.id())
            .and_then(|permit| Ok((permit, self.prepare(&payload)?)));
        let (permit, (descriptor, parser)) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return Err(report(request, session.as_ref(), err)),
        };
        info!(
            request_id = %request.request_id,
            job_id = %descriptor.job_id(),
            job_name = %descriptor.job_name(),
            "job descriptor built"
        );

        let sink = ResultSink::new(
            descriptor.job_id(),
            descriptor.job_name(),
            request.request_id.clone(),
            session,
            parser,
        )
        .with_enricher(self.collaborators.enricher.clone())
        .with_permit(permit);
        // A rejected submission is reported by the sink itself.
        self.broadcaster.submit(&descriptor, sink).await
    }

    fn prepare(&self, payload: &Payload) -> Result<(JobDescriptor, Arc<dyn ResultParser>)> {
        let c = &self.collaborators;
        let traversal = c.front_end.decode(payload)?;
        let traversal = c.front_end.apply_optimizations(traversal)?;
        debug!(traversal = %traversal, "traversal optimized");
        c.meta_fetcher.refresh()?;
        let plan = c.compiler.compile(&traversal)?;
        let parser = c.analyzer.analyze(&traversal)?;
        let descriptor = self.builder.build(&plan, &self.ids)?;
        Ok((descriptor, parser))
    }

    fn acquire_session_slot(&self, session_id: &str) -> Result<Option<OwnedSemaphorePermit>> {
        if self.concurrency == SessionConcurrency::Unbounded {
            return Ok(None);
        }
        let slot = {
            let mut slots = self
                .session_slots
                .lock()
                .expect("session slot lock poisoned");
            // Forget idle sessions.
            slots.retain(|_, s| Arc::strong_count(s) > 1 || s.available_permits() == 0);
            Arc::clone(
                slots
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };
        slot.try_acquire_owned().map(Some).map_err(|_| {
            GqdError::SessionBusy(format!("session {session_id} already has a job in flight"))
        })
    }
}

fn report(request: &OpRequest, session: &dyn Session, err: GqdError) -> GqdError {
    warn!(
        request_id = %request.request_id,
        op = %request.op,
        error = %err,
        "dispatch failed"
    );
    if let Err(write_err) = session.write(ResponseMessage::error(&request.request_id, &err)) {
        warn!(request_id = %request.request_id, error = %write_err, "error response not delivered");
    }
    err
}

fn op_label(op: &str) -> &str {
    match op {
        OP_BYTECODE | OP_EVAL => op,
        _ => "unsupported",
    }
}

fn error_kind(err: &GqdError) -> &'static str {
    match err {
        GqdError::InvalidConfig(_) => "invalid_config",
        GqdError::Planning(_) => "planning",
        GqdError::Unsupported(_) => "unsupported",
        GqdError::Metadata(_) => "metadata",
        GqdError::Compile(_) => "compile",
        GqdError::MalformedPlan(_) => "malformed_plan",
        GqdError::Submission(_) => "submission",
        GqdError::Stream(_) => "stream",
        GqdError::Protocol(_) => "protocol",
        GqdError::SessionBusy(_) => "session_busy",
        GqdError::Execution(_) | GqdError::Io(_) => "execution",
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
