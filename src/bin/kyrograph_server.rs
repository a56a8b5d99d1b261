//! kyrograph gRPC Server
//!
//! A standalone server binary for running a knowledge graph over gRPC.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kyrograph::gap::DetachedResearcher;
use kyrograph::transport::KnowledgeServiceImpl;
use kyrograph::{GraphConfig, KnowledgeGraph};

/// Command-line overrides applied on top of the config file.
#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
}

fn usage() {
    println!("kyrograph-server - temporal knowledge graph gRPC server");
    println!();
    println!("USAGE:");
    println!("    kyrograph-server [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>       TOML configuration file");
    println!("    -p, --port <PORT>         Port to listen on [default: 50071]");
    println!("    -d, --data-dir <DIR>      Data directory [default: ./graph.kyro]");
    println!("    -h, --help                Print help information");
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| iter.next().ok_or_else(|| format!("{flag} requires a value"));
        match arg.as_str() {
            "--config" | "-c" => args.config = Some(PathBuf::from(value("--config")?)),
            "--port" | "-p" => {
                let raw = value("--port")?;
                args.port = Some(raw.parse().map_err(|_| format!("invalid port number: {raw}"))?);
            }
            "--data-dir" | "-d" => args.data_dir = Some(PathBuf::from(value("--data-dir")?)),
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args().unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });

    let mut config = match &args.config {
        Some(path) => GraphConfig::from_file(path)?,
        None => GraphConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.addr.set_port(port);
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = Some(dir);
    }
    if config.storage.data_dir.is_none() {
        config.storage.data_dir = Some(PathBuf::from("./graph.kyro"));
    }
    let addr = config.server.addr;

    info!(version = env!("CARGO_PKG_VERSION"), data_dir = ?config.storage.data_dir, "opening graph");
    // Research needs an embedder-supplied collaborator; the bare server
    // records gaps and leaves them queued.
    let graph = tokio::task::spawn_blocking(move || KnowledgeGraph::new(config, Arc::new(DetachedResearcher)))
        .await??;

    let svc = KnowledgeServiceImpl::new(Arc::new(graph)).into_server();

    info!(%addr, "starting gRPC server (Ctrl+C to stop)");
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("shut down");
    Ok(())
}
