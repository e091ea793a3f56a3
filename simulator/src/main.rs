use anyhow::{Context, Result};
use casebox_simulator::{Api, Simulator, SimulatorConfig};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Require `init_data` signed with this bot token.
    #[arg(long)]
    bot_token: Option<String>,

    /// Balance credited to each new player, in cents.
    #[arg(long)]
    balance_cents: Option<u64>,
}

fn build_config(args: &Args) -> SimulatorConfig {
    let mut config = SimulatorConfig::from_env();
    if let Some(token) = args.bot_token.as_deref().map(str::trim) {
        config.bot_token = (!token.is_empty()).then(|| token.to_string());
    }
    if let Some(balance) = args.balance_cents {
        config.starting_balance_cents = balance;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = build_config(&args);
    info!(
        signed_init_data = config.bot_token.is_some(),
        starting_balance_cents = config.starting_balance_cents,
        cases = config.cases.len(),
        "starting simulator"
    );
    let simulator = Arc::new(Simulator::new(config));
    let app = Api::new(simulator).router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("axum server error")?;
    Ok(())
}
