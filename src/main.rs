// loqa-recorder: wearable audio capture service
//
// Usage:
//   loqa-recorder run               recover, (auto-)start, serve the API until Ctrl-C
//   loqa-recorder status            print the persisted snapshot and lock
//   loqa-recorder recover           salvage leftovers from a crashed run, then exit
//
// Add --synthetic to run without a microphone.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_recorder::audio::{CpalProvider, DeviceProvider, Segment, SyntheticProvider};
use loqa_recorder::events::{BroadcastSink, EventSink, FanoutSink, RecorderEvent};
use loqa_recorder::nats::NatsClient;
use loqa_recorder::recording::MONITOR_INTERVAL;
use loqa_recorder::session::read_snapshot;
use loqa_recorder::{create_router, AppState, Config, Engine, SessionStore, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "loqa-recorder", version)]
#[command(about = "Capture, encode and chunk microphone audio with crash recovery")]
struct Cli {
    /// Config file (without extension)
    #[arg(long, global = true, default_value = "config/loqa-recorder")]
    config: String,

    /// Use a simulated microphone
    #[arg(long, global = true)]
    synthetic: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Recover, start and serve until Ctrl-C (default)
    Run,
    /// Print persisted state without starting anything
    Status,
    /// Salvage chunks from a crashed run and exit
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let cfg = Config::load(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cfg, cli.synthetic).await,
        Command::Status => status(&cfg),
        Command::Recover => recover(&cfg, cli.synthetic).await,
    }
}

fn status(cfg: &Config) -> Result<()> {
    let store = SessionStore::new(cfg.recordings_dir()?);
    let snapshot = read_snapshot(store.layout().snapshot_path());

    println!("recording:     {}", snapshot.recording);
    println!("paused:        {}", snapshot.paused);
    println!("chunk counter: {}", snapshot.chunk_counter);
    println!("current bytes: {}", snapshot.current_bytes);

    match store.lock().read()? {
        Some(lock) => {
            println!("lock:          present (reason={}, last tick {})", lock.reason, lock.last_tick);
            if let Some(path) = lock.chunk_path {
                println!("lock chunk:    {}", path.display());
            }
        }
        None => println!("lock:          none"),
    }
    Ok(())
}

async fn recover(cfg: &Config, synthetic: bool) -> Result<()> {
    let store = Arc::new(SessionStore::open(cfg.recordings_dir()?)?);
    let supervisor = build_supervisor(store, synthetic, Arc::new(BroadcastSink::new(16)), cfg);
    let report = supervisor.recover(false).await?;

    for file in &report.recovered {
        println!("{}", file.path.display());
    }
    info!(
        "Recovered {} chunk(s); stale lock: {}",
        report.recovered.len(),
        report.was_locked
    );
    Ok(())
}

async fn run(cfg: &Config, synthetic: bool) -> Result<()> {
    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    let recordings = cfg.recordings_dir()?;
    info!("Recordings directory: {}", recordings.display());
    let store = Arc::new(SessionStore::open(&recordings)?);

    // Events: in-process log subscriber, plus NATS when configured
    let broadcast = Arc::new(BroadcastSink::new(64));
    let mut sinks = FanoutSink::new().with(broadcast.clone() as Arc<dyn EventSink>);

    if let Some(url) = &cfg.service.nats_url {
        let device_id = cfg
            .service
            .device_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match NatsClient::connect(url, device_id).await {
            Ok(client) => {
                client.spawn_ack_handler(Arc::clone(&store)).await?;
                sinks = sinks.with(Arc::new(client.into_sink()));
            }
            Err(e) => warn!("NATS unavailable, continuing without it: {:#}", e),
        }
    }

    let supervisor = Arc::new(build_supervisor(store, synthetic, Arc::new(sinks), cfg));

    let mut events = broadcast.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RecorderEvent::FileReady(file) = event {
                info!(
                    "File ready: {} ({} ms, recovered={})",
                    file.path.display(),
                    file.duration_ms,
                    file.recovered
                );
            }
        }
    });

    supervisor.recover(true).await?;

    if cfg.service.http.enabled {
        let app = create_router(AppState::new(Arc::clone(&supervisor)));
        let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("HTTP API listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP server failed: {}", e);
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(true);
        }
    });

    supervisor.run(MONITOR_INTERVAL, shutdown_rx).await?;
    info!("Stopped");
    Ok(())
}

fn build_supervisor(
    store: Arc<SessionStore>,
    synthetic: bool,
    events: Arc<dyn EventSink>,
    cfg: &Config,
) -> Supervisor {

    let provider: Arc<dyn DeviceProvider> = if synthetic {
        info!("Using synthetic microphone");
        // Speech, a long pause, more speech
        Arc::new(SyntheticProvider::new(vec![
            Segment::voice(Duration::from_secs(5), 3000),
            Segment::silence(Duration::from_secs(20)),
            Segment::voice(Duration::from_secs(10), 3000),
        ]))
    } else {
        Arc::new(CpalProvider::new())
    };

    let engine = Arc::new(Engine::new(provider, store, events));
    Supervisor::new(engine, cfg.recorder_settings())
}
