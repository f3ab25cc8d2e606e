//! Multi-endpoint job submission and result routing.
//!
//! [`ClusterBroadcaster::submit`] sends one job request to every configured
//! cluster endpoint and registers the job's result sink under its id. Each
//! registered job gets two tasks:
//! - a sink task running [`ResultSink::run`] over a bounded [`SinkEvent`] channel
//! - a pump task merging the partition streams into that channel
//!
//! A job completes once every partition stream ended. The first partition
//! error fails the job and drops the remaining streams. Cancelling a job drops
//! its event sender, which the sink reports as a cancelled terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream::{select_all, StreamExt};
use gqd_common::{global_metrics, GqdError, JobId, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ClusterChannel, ResultStream};
use crate::job::JobDescriptor;
use crate::sink::{ResultSink, SinkEvent, SinkOutcome};

struct Registration {
    cancel: oneshot::Sender<()>,
    sink: JoinHandle<SinkOutcome>,
}

#[derive(Default)]
struct SinkRegistry {
    closed: bool,
    jobs: HashMap<JobId, Registration>,
}

/// Caller-side handle of a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    outcome: oneshot::Receiver<SinkOutcome>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait until the job's sink reached its terminal state.
    pub async fn wait(self) -> Result<SinkOutcome> {
        self.outcome.await.map_err(|_| {
            GqdError::Execution(format!("result sink of job {} ended abnormally", self.job_id))
        })
    }
}

pub struct ClusterBroadcaster {
    channels: Vec<Arc<dyn ClusterChannel>>,
    registry: Arc<Mutex<SinkRegistry>>,
    sink_buffer: usize,
}

impl ClusterBroadcaster {
    pub fn new(channels: Vec<Arc<dyn ClusterChannel>>, sink_buffer: usize) -> Result<Self> {
        if channels.is_empty() {
            return Err(GqdError::InvalidConfig(
                "broadcaster needs at least one cluster channel".to_string(),
            ));
        }
        Ok(Self {
            channels,
            registry: Arc::new(Mutex::new(SinkRegistry::default())),
            sink_buffer: sink_buffer.max(1),
        })
    }

    pub fn endpoints(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.endpoint()).collect()
    }

    /// Number of registered jobs that have not reached a terminal state.
    pub fn active_jobs(&self) -> usize {
        lock(&self.registry).jobs.len()
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        lock(&self.registry).jobs.contains_key(&job_id)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.registry).closed
    }

    /// Submit `descriptor` to every endpoint and start streaming into `sink`.
    ///
    /// On synchronous failure the sink writes its failure response before
    /// this returns, and nothing stays registered.
    pub async fn submit(&self, descriptor: &JobDescriptor, sink: ResultSink) -> Result<JobHandle> {
        let job_id = descriptor.job_id();
        let mut sink = sink;
        if let Err(err) = self.check_admission(job_id) {
            return Err(reject(&mut sink, err));
        }

        let mut streams: Vec<ResultStream> = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            match channel.submit(descriptor.request().clone()).await {
                Ok(stream) => streams.push(stream),
                Err(err) => {
                    warn!(
                        job_id = %job_id,
                        endpoint = %channel.endpoint(),
                        error = %err,
                        "job submission rejected"
                    );
                    drop(streams);
                    return Err(reject(&mut sink, submission_error(err)));
                }
            }
        }

        let (events_tx, events_rx) = mpsc::channel(self.sink_buffer);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        {
            let mut registry = lock(&self.registry);
            // Re-checked under the lock: close() may have run while submitting.
            if registry.closed {
                drop(registry);
                return Err(reject(&mut sink, closed_error()));
            }
            let sink_task = tokio::spawn(async move {
                let outcome = sink.run(events_rx).await;
                let _ = outcome_tx.send(outcome.clone());
                outcome
            });
            registry.jobs.insert(
                job_id,
                Registration {
                    cancel: cancel_tx,
                    sink: sink_task,
                },
            );
            global_metrics().set_active_sinks(registry.jobs.len() as u64);
        }
        global_metrics().inc_jobs_submitted(self.channels.len() as u64);
        info!(
            job_id = %job_id,
            job_name = %descriptor.job_name(),
            partitions = self.channels.len(),
            "job submitted"
        );

        tokio::spawn(pump(
            job_id,
            streams,
            events_tx,
            cancel_rx,
            Arc::clone(&self.registry),
        ));
        Ok(JobHandle {
            job_id,
            outcome: outcome_rx,
        })
    }

    /// Stop accepting jobs and cancel every registered job.
    ///
    /// Waits for each cancelled sink to write its terminal response. Returns
    /// the number of jobs that were still registered.
    pub async fn close(&self) -> usize {
        let drained: Vec<(JobId, Registration)> = {
            let mut registry = lock(&self.registry);
            registry.closed = true;
            let drained = registry.jobs.drain().collect();
            global_metrics().set_active_sinks(0);
            drained
        };
        let count = drained.len();
        for (job_id, registration) in drained {
            // The pump may already have delivered a terminal event.
            let _ = registration.cancel.send(());
            match registration.sink.await {
                Ok(outcome) => {
                    debug!(job_id = %job_id, state = outcome.state.as_str(), "sink drained")
                }
                Err(err) => error!(job_id = %job_id, error = %err, "sink task failed"),
            }
        }
        info!(jobs = count, "broadcaster closed");
        count
    }

    fn check_admission(&self, job_id: JobId) -> Result<()> {
        let registry = lock(&self.registry);
        if registry.closed {
            return Err(closed_error());
        }
        if registry.jobs.contains_key(&job_id) {
            return Err(GqdError::Submission(format!(
                "job {job_id} is already registered"
            )));
        }
        Ok(())
    }
}

async fn pump(
    job_id: JobId,
    streams: Vec<ResultStream>,
    events: mpsc::Sender<SinkEvent>,
    mut cancel: oneshot::Receiver<()>,
    registry: Arc<Mutex<SinkRegistry>>,
) {
    let mut merged = select_all(streams);
    let terminal = loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                info!(job_id = %job_id, "job cancelled");
                break None;
            }
            item = merged.next() => match item {
                Some(Ok(frame)) if frame.job_id != job_id.0 => {
                    break Some(SinkEvent::Failed(GqdError::Protocol(format!(
                        "frame for job {} arrived on the stream of job {job_id}",
                        frame.job_id
                    ))));
                }
                Some(Ok(frame)) => {
                    if events.send(SinkEvent::Frame(frame.data)).await.is_err() {
                        debug!(job_id = %job_id, "sink finished early, dropping streams");
                        break None;
                    }
                }
                Some(Err(err)) => break Some(SinkEvent::Failed(err)),
                None => break Some(SinkEvent::Completed),
            },
        }
    };
    if let Some(event) = terminal {
        let _ = events.send(event).await;
    }
    drop(merged);
    drop(events);

    let mut registry = lock(&registry);
    if registry.jobs.remove(&job_id).is_some() {
        global_metrics().set_active_sinks(registry.jobs.len() as u64);
    }
}

fn reject(sink: &mut ResultSink, err: GqdError) -> GqdError {
    if let Err(write_err) = sink.on_failed(&err) {
        warn!(job_id = %sink.job_id(), error = %write_err, "failure response not delivered");
    }
    err
}

fn submission_error(err: GqdError) -> GqdError {
    match err {
        GqdError::Submission(_) => err,
        other => GqdError::Submission(other.to_string()),
    }
}

fn closed_error() -> GqdError {
    GqdError::Submission("broadcaster is closed".to_string())
}

fn lock(registry: &Mutex<SinkRegistry>) -> std::sync::MutexGuard<'_, SinkRegistry> {
    registry.lock().expect("sink registry lock poisoned")
}
