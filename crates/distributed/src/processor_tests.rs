use super::*;
use crate::channel::InProcessChannel;
use crate::session::{ChannelSession, ResponseStatus};
use crate::sink::{FixtureProperties, SinkState};
use gqd_planner::GraphSchema;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

struct ScriptedMetaFetcher {
    schema: SharedSchema,
    fail: AtomicBool,
    refreshes: AtomicUsize,
}

impl MetaFetcher for ScriptedMetaFetcher {
    fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GqdError::Metadata(
                "schema service unreachable".to_string(),
            ));
        }
        self.schema.publish(GraphSchema {
            vertex_labels: ["person", "software"].iter().map(|s| s.to_string()).collect(),
            edge_labels: ["knows", "created"].iter().map(|s| s.to_string()).collect(),
        })
    }
}

struct GarbageCompiler;

impl PlanCompiler for GarbageCompiler {
    fn compile(&self, _traversal: &gqd_planner::Traversal) -> Result<Vec<u8>> {
        Ok(vec![0xff, 0xff, 0xff])
    }
}

struct Harness {
    processor: Arc<DispatchOpProcessor>,
    channels: Vec<Arc<InProcessChannel>>,
    ids: Arc<JobIdAllocator>,
    meta: Arc<ScriptedMetaFetcher>,
}

fn harness(hosts: usize, concurrency: SessionConcurrency) -> Harness {
    harness_with(hosts, concurrency, |_| {})
}

fn harness_with(
    hosts: usize,
    concurrency: SessionConcurrency,
    customize: impl FnOnce(&mut Collaborators),
) -> Harness {
    let mut config = DispatchConfig::default();
    config.cluster.hosts = (0..hosts)
        .map(|i| format!("worker-{i}:1234"))
        .collect::<Vec<_>>()
        .join(",");
    config.cluster.batch_size = 64;
    config.cluster.memory_limit = 1024;
    config.cluster.output_capacity = 100;
    config.cluster.time_limit_ms = 5000;
    config.session_concurrency = concurrency;

    // Starts empty: compilation only succeeds after the dispatch refreshed it.
    let schema = SharedSchema::new();
    let meta = Arc::new(ScriptedMetaFetcher {
        schema: schema.clone(),
        fail: AtomicBool::new(false),
        refreshes: AtomicUsize::new(0),
    });
    let mut collaborators = Collaborators {
        front_end: Arc::new(TraversalFrontEnd::new()),
        meta_fetcher: Arc::clone(&meta) as Arc<dyn MetaFetcher>,
        compiler: Arc::new(IrPlanCompiler::new(schema)),
        analyzer: Arc::new(DefaultResultAnalyzer),
        enricher: None,
    };
    customize(&mut collaborators);

    let channels: Vec<Arc<InProcessChannel>> = (0..hosts)
        .map(|i| Arc::new(InProcessChannel::new(format!("inproc-{i}"))))
        .collect();
    let ids = Arc::new(JobIdAllocator::new());
    let processor = DispatchOpProcessor::new(
        &config,
        collaborators,
        channels
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn ClusterChannel>)
            .collect(),
        Arc::clone(&ids),
    )
    .expect("processor");
    Harness {
        processor: Arc::new(processor),
        channels,
        ids,
        meta,
    }
}

fn session(id: &str) -> (Arc<dyn Session>, mpsc::UnboundedReceiver<ResponseMessage>) {
    let (session, rx) = ChannelSession::new(id);
    (Arc::new(session), rx)
}

fn eval(request_id: &str, script: &str) -> OpRequest {
    OpRequest::new(request_id, OP_EVAL, script.as_bytes().to_vec())
}

fn responses(rx: &mut mpsc::UnboundedReceiver<ResponseMessage>) -> Vec<ResponseMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn total_submissions(h: &Harness) -> usize {
    h.channels.iter().map(|c| c.submitted().len()).sum()
}

#[tokio::test]
async fn dispatch_submits_complete_descriptor_and_streams_to_success() {
    let h = harness(2, SessionConcurrency::Unbounded);
    let (s, mut rx) = session("s1");
    let handle = h
        .processor
        .dispatch(
            eval("r1", "g.V().hasLabel('person').values('name')"),
            Arc::clone(&s),
        )
        .await
        .expect("dispatch");

    let id = handle.job_id().0;
    assert_eq!(id, h.ids.last_issued());
    for channel in &h.channels {
        let submitted = channel.submitted();
        assert_eq!(submitted.len(), 1);
        let conf = submitted[0].conf.clone().expect("conf");
        assert_eq!(conf.job_id, id);
        assert_eq!(conf.job_name, format!("ir_plan_{id}"));
        assert_eq!(conf.servers, vec![0, 1]);
        assert_eq!(conf.workers, 2);
        assert_eq!(conf.batch_size, 64);
        assert_eq!(conf.memory_limit, 1024);
        assert_eq!(conf.output_capacity, 100);
        assert_eq!(conf.time_limit, 5000);
        assert_eq!(submitted[0].source, b"g".to_vec());
    }
    assert_eq!(h.meta.refreshes.load(Ordering::SeqCst), 1);

    assert!(h.channels[0].push_frame(id, br#"["marko","vadas"]"#.to_vec()));
    assert!(h.channels[0].finish(id));
    assert!(h.channels[1].push_frame(id, br#""josh""#.to_vec()));
    assert!(h.channels[1].finish(id));

    let outcome = handle.wait().await.expect("outcome");
    assert_eq!(outcome.state, SinkState::Completed);
    assert_eq!(outcome.values, 3);

    let msgs = responses(&mut rx);
    assert_eq!(msgs.len(), 3);
    assert!(msgs.iter().all(|m| m.request_id == "r1"));
    assert_eq!(msgs[2].status, ResponseStatus::Success);
    let names: Vec<Value> = msgs[..2].iter().flat_map(|m| m.data.clone()).collect();
    assert_eq!(names.len(), 3);
    assert!(names.contains(&json!("josh")));
}

#[tokio::test]
async fn bytecode_op_runs_same_pipeline() {
    let h = harness(1, SessionConcurrency::Unbounded);
    let (s, mut rx) = session("s1");
    let payload = br#"{"steps":[["V"],["identity"],["out","knows"],["count"]]}"#.to_vec();
    let handle = h
        .processor
        .dispatch(OpRequest::new("r1", OP_BYTECODE, payload), s)
        .await
        .expect("dispatch");

    let plan: Vec<gqd_planner::Step> =
        serde_json::from_slice(&h.channels[0].submitted()[0].plan).expect("plan json");
    let names: Vec<&str> = plan.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["V", "out", "count"]);

    let id = handle.job_id().0;
    h.channels[0].push_frame(id, b"[4]".to_vec());
    h.channels[0].finish(id);
    assert_eq!(handle.wait().await.expect("outcome").state, SinkState::Completed);
    assert_eq!(responses(&mut rx)[0].data, vec![json!(4)]);
}

#[tokio::test]
async fn filtered_and_projected_scalars_stream_to_success() {
    let h = harness(1, SessionConcurrency::Unbounded);
    for script in [
        "g.V().values('name').limit(1)",
        "g.V().id()",
        "g.V().values('name').dedup()",
        "g.V().hasLabel('person').label().order()",
    ] {
        let (s, mut rx) = session("s1");
        let handle = h
            .processor
            .dispatch(eval("r1", script), s)
            .await
            .expect(script);
        let id = handle.job_id().0;
        assert!(h.channels[0].push_frame(id, br#"["marko"]"#.to_vec()));
        assert!(h.channels[0].finish(id));

        let outcome = handle.wait().await.expect("outcome");
        assert_eq!(outcome.state, SinkState::Completed, "{script}: {:?}", outcome.message);
        let msgs = responses(&mut rx);
        assert_eq!(msgs[0].data, vec![json!("marko")], "{script}");
        assert_eq!(msgs.last().map(|m| m.status), Some(ResponseStatus::Success));
    }
}

#[tokio::test]
async fn unknown_op_writes_one_error_and_allocates_nothing() {
    let h = harness(2, SessionConcurrency::Unbounded);
    let (s, mut rx) = session("s1");
    let err = h
        .processor
        .dispatch(OpRequest::new("r1", "unknown", b"g.V()".to_vec()), s)
        .await
        .expect_err("unsupported");
    assert!(matches!(err, GqdError::Unsupported(_)));

    let msgs = responses(&mut rx);
    assert_eq!(msgs.len(), 1);
    assert!(msgs[0].status.is_server_error());
    assert!(msgs[0].message.contains("unknown"));
    assert_eq!(h.ids.last_issued(), 0);
    assert_eq!(h.meta.refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(total_submissions(&h), 0);
}

#[tokio::test]
async fn metadata_refresh_failure_aborts_before_id_issue() {
    let h = harness(2, SessionConcurrency::Unbounded);
    h.meta.fail.store(true, Ordering::SeqCst);
    let (s, mut rx) = session("s1");
    let err = h
        .processor
        .dispatch(eval("r1", "g.V().count()"), s)
        .await
        .expect_err("metadata");
    assert!(matches!(err, GqdError::Metadata(_)));

    let msgs = responses(&mut rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].status, ResponseStatus::ServerError);
    assert!(msgs[0].message.contains("unreachable"));
    assert_eq!(h.ids.last_issued(), 0);
    assert_eq!(total_submissions(&h), 0);
}

#[tokio::test]
async fn decode_and_compile_failures_are_reported_once() {
    let h = harness(1, SessionConcurrency::Unbounded);
    let (s, mut rx) = session("s1");

    let err = h
        .processor
        .dispatch(eval("r1", "g.V("), Arc::clone(&s))
        .await
        .expect_err("parse");
    assert!(matches!(err, GqdError::Planning(_)));
    let err = h
        .processor
        .dispatch(eval("r2", "g.V().out('owns')"), Arc::clone(&s))
        .await
        .expect_err("unknown edge label");
    assert!(matches!(err, GqdError::Compile(_)));
    let err = h
        .processor
        .dispatch(OpRequest::new("r3", OP_EVAL, vec![0xc3, 0x28]), s)
        .await
        .expect_err("invalid utf-8");
    assert!(matches!(err, GqdError::Planning(_)));

    let msgs = responses(&mut rx);
    let ids: Vec<&str> = msgs.iter().map(|m| m.request_id.as_str()).collect();
    assert_eq!(ids, vec!["r1", "r2", "r3"]);
    assert!(msgs
        .iter()
        .all(|m| m.status == ResponseStatus::ServerErrorEvaluation));
    assert_eq!(h.ids.last_issued(), 0);
}

#[tokio::test]
async fn malformed_plan_fails_without_consuming_id() {
    let h = harness_with(1, SessionConcurrency::Unbounded, |c| {
        c.compiler = Arc::new(GarbageCompiler);
    });
    let (s, mut rx) = session("s1");
    let err = h
        .processor
        .dispatch(eval("r1", "g.V()"), s)
        .await
        .expect_err("malformed");
    assert!(matches!(err, GqdError::MalformedPlan(_)));
    assert_eq!(responses(&mut rx).len(), 1);
    assert_eq!(h.ids.last_issued(), 0);
    assert_eq!(total_submissions(&h), 0);
}

#[tokio::test]
async fn rejected_submission_is_reported_once_and_not_registered() {
    let h = harness(2, SessionConcurrency::Unbounded);
    h.channels[1].reject_with("queue full");
    let (s, mut rx) = session("s1");
    let err = h
        .processor
        .dispatch(eval("r1", "g.V()"), s)
        .await
        .expect_err("submission");
    assert!(matches!(err, GqdError::Submission(_)));

    let msgs = responses(&mut rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].status, ResponseStatus::ServerError);
    assert!(msgs[0].message.contains("queue full"));
    assert_eq!(h.processor.broadcaster().active_jobs(), 0);
}

#[tokio::test]
async fn close_cancels_in_flight_jobs() {
    let h = harness(1, SessionConcurrency::Unbounded);
    let (s, mut rx) = session("s1");
    let first = h
        .processor
        .dispatch(eval("r1", "g.V()"), Arc::clone(&s))
        .await
        .expect("first");
    let second = h
        .processor
        .dispatch(eval("r2", "g.V()"), Arc::clone(&s))
        .await
        .expect("second");
    assert_eq!(second.job_id().0, first.job_id().0 + 1);

    assert_eq!(h.processor.close().await, 2);
    assert_eq!(first.wait().await.expect("first").state, SinkState::Cancelled);
    assert_eq!(second.wait().await.expect("second").state, SinkState::Cancelled);

    let msgs = responses(&mut rx);
    assert_eq!(msgs.len(), 2);
    assert!(msgs.iter().all(|m| m.status == ResponseStatus::Cancelled));

    let err = h
        .processor
        .dispatch(eval("r3", "g.V()"), s)
        .await
        .expect_err("closed");
    assert!(matches!(err, GqdError::Submission(_)));
    assert_eq!(responses(&mut rx).len(), 1);
}

#[tokio::test]
async fn single_flight_rejects_second_job_of_same_session() {
    let h = harness(1, SessionConcurrency::SingleFlight);
    let (s1, mut rx1) = session("s1");
    let (s2, _rx2) = session("s2");

    let first = h
        .processor
        .dispatch(eval("r1", "g.V()"), Arc::clone(&s1))
        .await
        .expect("first");
    let err = h
        .processor
        .dispatch(eval("r2", "g.V()"), Arc::clone(&s1))
        .await
        .expect_err("busy");
    assert!(matches!(err, GqdError::SessionBusy(_)));
    let other = h
        .processor
        .dispatch(eval("r3", "g.V()"), s2)
        .await
        .expect("other session");
    // A busy rejection happens before any id is issued.
    assert_eq!(other.job_id().0, first.job_id().0 + 1);

    let id = first.job_id().0;
    h.channels[0].finish(id);
    first.wait().await.expect("first outcome");
    let msgs = responses(&mut rx1);
    assert_eq!(msgs[0].status, ResponseStatus::ServerErrorEvaluation);
    assert_eq!(msgs[1].status, ResponseStatus::Success);

    h.processor
        .dispatch(eval("r4", "g.V()"), s1)
        .await
        .expect("slot released after terminal state");
}

#[tokio::test]
async fn fixture_enrichment_applies_to_streamed_elements() {
    let h = harness_with(1, SessionConcurrency::Unbounded, |c| {
        c.enricher = Some(Arc::new(FixtureProperties::modern()));
    });
    let (s, mut rx) = session("s1");
    let handle = h
        .processor
        .dispatch(eval("r1", "g.V().hasLabel('person')"), s)
        .await
        .expect("dispatch");
    let id = handle.job_id().0;
    h.channels[0].push_frame(id, br#"[{"id":1,"label":"person"}]"#.to_vec());
    h.channels[0].finish(id);
    handle.wait().await.expect("outcome");

    let msgs = responses(&mut rx);
    assert_eq!(msgs[0].data[0]["properties"]["name"], json!("marko"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatches_get_distinct_increasing_ids() {
    let h = harness(1, SessionConcurrency::Unbounded);
    let mut tasks = Vec::new();
    for i in 0..16 {
        let processor = Arc::clone(&h.processor);
        tasks.push(tokio::spawn(async move {
            let (s, _rx) = session(&format!("s{i}"));
            processor
                .dispatch(eval(&format!("r{i}"), "g.V()"), s)
                .await
                .map(|handle| handle.job_id())
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.expect("join").expect("dispatch"));
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert_eq!(h.ids.last_issued(), 16);
    assert_eq!(h.processor.close().await, 16);
}
