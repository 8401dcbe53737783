//! lockstep-node entry point.
//!
//! ```text
//! lockstep-node                          Run the session from the config file
//! lockstep-node --listen 7777            Admit peers on UDP port 7777
//! lockstep-node --connect host:7777      Join a listening node
//! lockstep-node --name bob --ticks 500   Override name, leave after 500 ticks
//! lockstep-node --config <path>          Load a custom config TOML
//! lockstep-node --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lockstep_node::config::{Mode, NodeConfig};
use lockstep_node::service::NodeService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lockstep-node", about = "Lockstep simulation demo node")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "lockstep-node.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Listen for peers on this UDP port.
    #[arg(long, conflicts_with = "connect")]
    listen: Option<u16>,

    /// Join the node listening at this address.
    #[arg(long)]
    connect: Option<String>,

    /// Name announced to peers.
    #[arg(long)]
    name: Option<String>,

    /// Leave after this many ticks.
    #[arg(long)]
    ticks: Option<u64>,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(port) = self.listen {
            config.session.mode = Mode::Listen;
            config.session.port = port;
        }
        if let Some(address) = &self.connect {
            config.session.mode = Mode::Connect;
            config.session.address = address.clone();
        }
        if let Some(name) = &self.name {
            config.session.name = name.clone();
        }
        if self.ticks.is_some() {
            config.session.ticks = self.ticks;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = NodeConfig::load(&cli.config);
    cli.apply(&mut config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("lockstep-node v{}", env!("CARGO_PKG_VERSION"));
    info!("mode: {:?}", config.session.mode);
    info!("name: {}", config.session.name);
    info!("tick rate: {}/s", config.session.iterations_per_second);
    info!("latency: {}", config.sync.latency);

    let service = NodeService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, leaving the session");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
