//! Per-job result consumer.
//!
//! A [`ResultSink`] owns everything needed to turn one job's raw result
//! frames into session responses: the session write handle, the result parser
//! and the optional enrichment context. It runs as a single consumer task fed
//! by a [`SinkEvent`] channel, so frames are handled strictly in arrival order.
//!
//! State machine:
//! `Submitted -> Streaming -> {Completed | Failed | Cancelled}`.
//! Exactly one terminal response is written per job. Any event after the
//! terminal state is rejected with [`GqdError::Protocol`].

use std::collections::HashMap;
use std::sync::Arc;

use gqd_common::{global_metrics, GqdError, JobId, Result};
use gqd_planner::ResultParser;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::session::{ResponseMessage, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Submitted,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SinkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SinkState::Completed | SinkState::Failed | SinkState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SinkState::Submitted => "submitted",
            SinkState::Streaming => "streaming",
            SinkState::Completed => "completed",
            SinkState::Failed => "failed",
            SinkState::Cancelled => "cancelled",
        }
    }
}

/// Message delivered to a sink's consumer task.
///
/// Closing the channel without a terminal event cancels the job.
#[derive(Debug)]
pub enum SinkEvent {
    Frame(Vec<u8>),
    Completed,
    Failed(GqdError),
}

/// Final report of a sink, returned once it reached a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkOutcome {
    pub job_id: JobId,
    pub state: SinkState,
    /// Frames received, including a frame whose decoding failed the job.
    pub frames: u64,
    /// Values written to the session.
    pub values: u64,
    /// Failure or cancellation message sent with the terminal response.
    pub message: Option<String>,
}

/// Post-processing applied to every decoded result value.
pub trait ResultEnricher: Send + Sync {
    fn enrich(&self, value: Value) -> Value;
}

/// Merges known per-element properties of a fixture graph into element values.
///
/// Elements are matched by their `id` field; properties already present on
/// the value win over fixture properties.
#[derive(Debug, Clone, Default)]
pub struct FixtureProperties {
    by_id: HashMap<String, Map<String, Value>>,
}

impl FixtureProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertex properties of the classic six-vertex "modern" test graph.
    pub fn modern() -> Self {
        [
            (1, json!({"name": "marko", "age": 29})),
            (2, json!({"name": "vadas", "age": 27})),
            (3, json!({"name": "lop", "lang": "java"})),
            (4, json!({"name": "josh", "age": 32})),
            (5, json!({"name": "ripple", "lang": "java"})),
            (6, json!({"name": "peter", "age": 35})),
        ]
        .into_iter()
        .fold(Self::new(), |fixture, (id, props)| {
            fixture.with_element(json!(id), props)
        })
    }

    /// Register properties for the element with `id`. Non-object `props` are ignored.
    pub fn with_element(mut self, id: Value, props: Value) -> Self {
        if let Value::Object(map) = props {
            self.by_id.insert(id_key(&id), map);
        }
        self
    }
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ResultEnricher for FixtureProperties {
    fn enrich(&self, mut value: Value) -> Value {
        let Some(element) = value.as_object_mut() else {
            return value;
        };
        let Some(props) = element.get("id").and_then(|id| self.by_id.get(&id_key(id))) else {
            return value;
        };
        let target = element
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = target {
            for (k, v) in props {
                existing.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        value
    }
}

pub struct ResultSink {
    job_id: JobId,
    job_name: String,
    request_id: String,
    session: Arc<dyn Session>,
    parser: Arc<dyn ResultParser>,
    enricher: Option<Arc<dyn ResultEnricher>>,
    state: SinkState,
    frames: u64,
    values: u64,
    message: Option<String>,
    // Released when the sink is dropped, i.e. after its terminal response.
    _permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("job_id", &self.job_id)
            .field("job_name", &self.job_name)
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("frames", &self.frames)
            .finish()
    }
}

impl ResultSink {
    pub fn new(
        job_id: JobId,
        job_name: impl Into<String>,
        request_id: impl Into<String>,
        session: Arc<dyn Session>,
        parser: Arc<dyn ResultParser>,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            request_id: request_id.into(),
            session,
            parser,
            enricher: None,
            state: SinkState::Submitted,
            frames: 0,
            values: 0,
            message: None,
            _permit: None,
        }
    }

    pub fn with_enricher(mut self, enricher: Option<Arc<dyn ResultEnricher>>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Hold a session concurrency permit until the sink is torn down.
    pub fn with_permit(mut self, permit: Option<OwnedSemaphorePermit>) -> Self {
        self._permit = permit;
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn outcome(&self) -> SinkOutcome {
        SinkOutcome {
            job_id: self.job_id,
            state: self.state,
            frames: self.frames,
            values: self.values,
            message: self.message.clone(),
        }
    }

    /// Decode one frame and write its values as a partial response.
    ///
    /// A frame that fails to decode fails the job.
    pub fn on_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.ensure_open("frame")?;
        self.state = SinkState::Streaming;
        self.frames += 1;

        let values = match self.parser.parse(frame) {
            Ok(values) => {
                global_metrics().record_result_frame("ok", frame.len() as u64);
                values
            }
            Err(err) => {
                global_metrics().record_result_frame("rejected", frame.len() as u64);
                warn!(job_id = %self.job_id, error = %err, "result frame rejected by parser");
                return self.on_failed(&err);
            }
        };
        let values = match &self.enricher {
            Some(enricher) => values.into_iter().map(|v| enricher.enrich(v)).collect(),
            None => values,
        };
        debug!(
            job_id = %self.job_id,
            frame = self.frames,
            values = values.len(),
            "result frame decoded"
        );
        if values.is_empty() {
            return Ok(());
        }
        self.values += values.len() as u64;
        self.session
            .write(ResponseMessage::partial(&self.request_id, values))
    }

    pub fn on_completed(&mut self) -> Result<()> {
        let response = ResponseMessage::success(&self.request_id);
        self.finish(SinkState::Completed, response)
    }

    pub fn on_failed(&mut self, err: &GqdError) -> Result<()> {
        let response = ResponseMessage::error(&self.request_id, err);
        self.finish(SinkState::Failed, response)
    }

    pub fn on_cancelled(&mut self, reason: &str) -> Result<()> {
        let response = ResponseMessage::cancelled(&self.request_id, reason);
        self.finish(SinkState::Cancelled, response)
    }

    /// Consume events until the job reaches a terminal state.
    ///
    /// The channel closing first is a cancellation.
    pub async fn run(mut self, mut events: mpsc::Receiver<SinkEvent>) -> SinkOutcome {
        while !self.state.is_terminal() {
            let result = match events.recv().await {
                Some(SinkEvent::Frame(frame)) => self.on_frame(&frame),
                Some(SinkEvent::Completed) => self.on_completed(),
                Some(SinkEvent::Failed(err)) => self.on_failed(&err),
                None => self.on_cancelled("job cancelled before completion"),
            };
            if let Err(err) = result {
                error!(job_id = %self.job_id, error = %err, "result delivery failed");
                if !self.state.is_terminal() {
                    // Session is gone; no terminal response can be delivered.
                    self.message = Some(err.to_string());
                    self.state = SinkState::Failed;
                    global_metrics().inc_job_terminal(self.state.as_str());
                }
            }
        }
        self.outcome()
    }

    fn ensure_open(&self, what: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(GqdError::Protocol(format!(
                "{what} for job {} after terminal state {}",
                self.job_id,
                self.state.as_str()
            )));
        }
        Ok(())
    }

    fn finish(&mut self, state: SinkState, response: ResponseMessage) -> Result<()> {
        self.ensure_open(state.as_str())?;
        self.state = state;
        if !response.message.is_empty() {
            self.message = Some(response.message.clone());
        }
        global_metrics().inc_job_terminal(state.as_str());
        info!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            request_id = %self.request_id,
            state = state.as_str(),
            frames = self.frames,
            "job reached terminal state"
        );
        self.session.write(response)
    }
}
