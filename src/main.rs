use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshmonitor::api;
use meshmonitor::config::{Config, LoggingConfig};
use meshmonitor::ingest::IngestPipeline;
use meshmonitor::scheduler;
use meshmonitor::session::DeviceSession;
use meshmonitor::store::Store;

#[derive(Parser)]
#[command(name = "meshmonitor")]
#[command(about = "A mesh-network gateway and state store for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshmonitor.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway: connect to the radio, serve the HTTP API
    Start,
    /// Write a default configuration file
    Init,
    /// Report whether the configured database exists and what schema version it's at
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).await.ok();
    init_logging(cli.verbose, config.as_ref().map(|c| &c.logging));

    info!("Starting MeshMonitor v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Start => run_gateway(&cli.config).await?,
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => show_status(&cli.config).await?,
    }

    Ok(())
}

/// `-v`/`-vv` on the command line always wins over the configured level,
/// since it's a more specific, one-off ask from whoever's running the
/// binary right now. Absent that, `[logging].level` sets the default filter
/// and `[logging].file` redirects output there instead of stderr.
fn init_logging(verbose: u8, logging: Option<&LoggingConfig>) {
    let level = match verbose {
        0 => logging.map(|l| l.level.as_str()).unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if let Some(path) = logging.and_then(|l| l.file.as_deref()) {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("warning: couldn't open log file {path}: {e}, logging to stderr"),
        }
    }

    builder.init();
}

/// Wires the four core subsystems together (spec.md §2's data flow): the
/// `DeviceSession` read loop feeds the `IngestPipeline`, which mutates the
/// `Store`; the `Scheduler` and automation hooks read the `Store` and
/// enqueue outbound commands on the session; the `api` router serves reads
/// from the `Store` and forwards writes to the session. Each subsystem runs
/// as its own task, matching the concurrency model in spec.md §5.
async fn run_gateway(config_path: &str) -> Result<()> {
    let config = Config::load(config_path).await?;
    let store = Store::open(&config.store.db_path)?;

    let (session, packet_rx) = DeviceSession::new(config.radio.clone());
    let session_handle = session.handle();

    let ingest = IngestPipeline::new(
        store.clone(),
        session_handle.clone(),
        &config.radio,
        config.automation.clone(),
    );

    tokio::spawn(session.run());
    tokio::spawn(ingest.run(packet_rx));
    tokio::spawn(scheduler::run(
        store.clone(),
        session_handle.clone(),
        config.scheduler.clone(),
        config.automation.clone(),
        config.store.clone(),
    ));

    let radio_endpoint = format!("{}:4403", config.radio.node_ip);
    let router = api::build_router(store, session_handle, radio_endpoint);

    let addr = format!("0.0.0.0:{}", config.http.port);
    info!("HTTP API listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn show_status(config_path: &str) -> Result<()> {
    let config = Config::load(config_path).await?;
    let db_exists = std::path::Path::new(&config.store.db_path).exists();
    println!("Radio:      {} ({:?})", config.radio.node_ip, config.radio.transport);
    println!("Database:   {} (exists: {db_exists})", config.store.db_path);
    println!("HTTP port:  {}", config.http.port);
    if db_exists {
        let store = Store::open(&config.store.db_path)?;
        let nodes = store.list_nodes().await?;
        println!("Nodes seen: {}", nodes.len());
    }
    Ok(())
}
