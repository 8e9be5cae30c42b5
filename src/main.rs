//! Embedding Broker Main
//!
//! Entry point for one backend instance: loads the encoder, then serves it on
//! the port the backend directory assigns to it.

use std::path::PathBuf;

use clap::Parser;
use embedding_service::{Broker, EncoderDispatcher, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "embedding-broker", version, about = "Broker serving one embedding backend")]
struct Args {
    /// Backend to serve (sbert, fasttext, simcse, supsimcse)
    #[arg(long)]
    embedding: String,

    /// Model name or path
    #[arg(long)]
    model: String,

    /// Number of worker threads [default: 4]
    #[arg(long)]
    num_workers: Option<usize>,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind, overriding the config file
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overriding the backend directory
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.embedding.backend = args.embedding;
    config.embedding.model = args.model;
    if let Some(workers) = args.num_workers {
        config.performance.worker_threads = workers;
    }
    if let Some(host) = args.host {
        config.network.host = host;
    }
    if args.port.is_some() {
        config.network.port = args.port;
    }

    // Initialize tracing
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        match config.monitoring.log_level.to_lowercase().as_str() {
            "trace" => "embedding_service=trace,trace".to_string(),
            "debug" => "embedding_service=debug,debug".to_string(),
            "info" => "embedding_service=info,info".to_string(),
            "warn" => "embedding_service=warn,warn".to_string(),
            "error" => "embedding_service=error,error".to_string(),
            _ => "embedding_service=info,info".to_string(),
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .without_time()
        .init();

    println!("🚀 Embedding Broker");
    println!("🧠 Backend: {} ({})", config.embedding.backend, config.embedding.model);
    println!("📊 Log Level: {}", config.monitoring.log_level);
    println!("===============================");

    let options = config.sentence_options();
    let (backend, model) = (&config.embedding.backend, &config.embedding.model);
    let dispatcher = if config.embedding.fail_fast {
        EncoderDispatcher::load(backend, model, &options)?
    } else {
        EncoderDispatcher::load_or_defer(backend, model, &options)?
    };
    let dispatcher = dispatcher.with_default_batch_size(config.embedding.default_batch_size);

    let broker = Broker::bind(config, dispatcher).await?;

    println!("✅ Broker listening on {}", broker.local_addr());
    println!("🛑 Press Ctrl+C to stop");

    broker
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
