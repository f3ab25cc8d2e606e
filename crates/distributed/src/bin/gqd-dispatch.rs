use std::env;
use std::sync::Arc;

use gqd_common::{DispatchConfig, JobIdAllocator};
use gqd_distributed::{
    ChannelSession, ClusterChannel, Collaborators, DispatchOpProcessor, FixtureProperties,
    GrpcClusterChannel, OpRequest, Session, OP_BYTECODE, OP_EVAL,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: gqd-dispatch eval <script> | gqd-dispatch bytecode <file>";

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn endpoint_url(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn read_request(args: &[String]) -> Result<OpRequest, Box<dyn std::error::Error>> {
    match args {
        [op, script] if op == OP_EVAL => {
            Ok(OpRequest::new("cli-1", OP_EVAL, script.as_bytes().to_vec()))
        }
        [op, path] if op == OP_BYTECODE => {
            Ok(OpRequest::new("cli-1", OP_BYTECODE, std::fs::read(path)?))
        }
        _ => Err(USAGE.into()),
    }
}

#[cfg(feature = "profiling")]
fn spawn_metrics_exporter() -> Result<(), Box<dyn std::error::Error>> {
    if let Ok(bind) = env::var("GQD_METRICS_BIND") {
        let addr: std::net::SocketAddr = bind.parse()?;
        info!(%addr, "serving metrics");
        tokio::spawn(async move {
            if let Err(err) = gqd_common::run_metrics_exporter(addr).await {
                tracing::error!(error = %err, "metrics exporter stopped");
            }
        });
    }
    Ok(())
}

#[cfg(not(feature = "profiling"))]
fn spawn_metrics_exporter() -> Result<(), Box<dyn std::error::Error>> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    spawn_metrics_exporter()?;

    let args: Vec<String> = env::args().skip(1).collect();
    let request = read_request(&args)?;
    let config = match env::var("GQD_CONFIG_PATH") {
        Ok(path) => DispatchConfig::load_from_json(&path)?,
        Err(_) => DispatchConfig::from_env(),
    };
    let schema_path = env_or_default("GQD_SCHEMA_PATH", "schema.json");

    let mut channels: Vec<Arc<dyn ClusterChannel>> = Vec::new();
    for host in config.cluster.host_list() {
        channels.push(Arc::new(GrpcClusterChannel::connect(&endpoint_url(&host)).await?));
    }
    info!(
        hosts = channels.len(),
        schema_path = %schema_path,
        "gqd-dispatch connected"
    );

    let mut collaborators = Collaborators::with_schema_file(schema_path);
    if env::var("GQD_FIXTURE_MODERN").is_ok_and(|v| v == "1") {
        collaborators = collaborators.with_enricher(Arc::new(FixtureProperties::modern()));
    }
    let processor = DispatchOpProcessor::new(
        &config,
        collaborators,
        channels,
        Arc::new(JobIdAllocator::new()),
    )?;

    let (session, mut responses) = ChannelSession::new("cli");
    let session: Arc<dyn Session> = Arc::new(session);
    let printer = tokio::spawn(async move {
        while let Some(response) = responses.recv().await {
            match serde_json::to_string(&response) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("unprintable response: {err}"),
            }
        }
    });

    let dispatched = processor.dispatch(request, Arc::clone(&session)).await;
    let outcome = match dispatched {
        Ok(handle) => Some(handle.wait().await?),
        Err(_) => None,
    };
    processor.close().await;
    drop(session);
    drop(processor);
    printer.await?;

    match outcome {
        Some(o) if o.state == gqd_distributed::SinkState::Completed => Ok(()),
        Some(o) => Err(format!("job {} ended {}", o.job_id, o.state.as_str()).into()),
        None => Err("dispatch failed".into()),
    }
}
