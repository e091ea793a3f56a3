//! Command line front end for the casebox API.
//!
//! Usage:
//!   casebox login --init-data '<query string from the host>'
//!   casebox me
//!   casebox cases
//!   casebox open --case-id starter --verify

use anyhow::{bail, Context, Result};
use casebox_client::{Client, ClientConfig, DrawController, FileTokenStore, OpenOutcome};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_TOKEN_PATH: &str = ".casebox/session.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "Open provably-fair cases from the terminal")]
struct Args {
    /// API base URL, e.g. http://localhost:8000/api/v1/
    #[arg(short, long)]
    url: Option<String>,

    /// Where the refresh token is kept between runs.
    #[arg(long)]
    token_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange host init data for a session.
    Login {
        #[arg(long)]
        init_data: String,
    },
    /// Forget the stored session.
    Logout,
    /// Show the logged in user.
    Me,
    /// List available cases.
    Cases,
    /// Run one full draw on a case.
    Open {
        #[arg(long)]
        case_id: String,

        /// Recompute the draw from the revealed seed.
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Serialize)]
struct OpenSummary {
    case_id: String,
    nonce: Option<u64>,
    client_seed: String,
    server_seed_id: String,
    tier: Option<String>,
    coin_id: String,
    amount: String,
    usd_value: String,
    verified: Option<bool>,
    roll: Option<f64>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_client(args: &Args) -> Result<Client> {
    let mut config = ClientConfig::from_env();
    if let Some(url) = &args.url {
        config = config.with_base_url(url.clone());
    }
    let token_path = args
        .token_path
        .clone()
        .or_else(|| config.token_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_PATH));
    let client = Client::with_config(&config, Arc::new(FileTokenStore::new(token_path)))
        .context("invalid client configuration")?;
    client.restore().context("failed to read stored session")?;
    Ok(client)
}

async fn open(client: Client, case_id: String, verify: bool) -> Result<()> {
    let controller = DrawController::new(client, case_id.clone());
    let admission = controller.enter().await?;
    if !admission.spin {
        bail!(
            "case {case_id} is not available: {}",
            admission.reason.as_deref().unwrap_or("unknown reason")
        );
    }
    let commitment = controller.commit().await?;
    info!(server_seed_id = %commitment.server_seed_id, hash = %commitment.hash, "committed");
    let nonce = controller.snapshot().next_nonce;
    let result = match controller.open().await? {
        OpenOutcome::Drawn(result) => result,
        OpenOutcome::AlreadyDrawing => bail!("a draw is already in flight"),
    };

    let mut summary = OpenSummary {
        case_id,
        nonce,
        client_seed: controller.client_seed(),
        server_seed_id: commitment.server_seed_id,
        tier: result.prize.reward_tier.clone(),
        coin_id: result.prize.coin_id().to_string(),
        amount: result.prize.amount().to_string(),
        usd_value: result.prize.usd_value.clone(),
        verified: None,
        roll: None,
    };
    if verify {
        match controller.verify().await {
            Ok(report) => {
                summary.verified = Some(true);
                summary.roll = Some(report.roll.as_f64());
            }
            Err(casebox_client::Error::VerificationMismatch(mismatch)) => {
                print_json(&summary)?;
                bail!("draw failed verification: {mismatch}");
            }
            Err(err) => return Err(err.into()),
        }
    }
    print_json(&summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let client = build_client(&args)?;
    match args.command {
        Command::Login { init_data } => {
            client.login(&init_data).await.context("login failed")?;
            print_json(&client.current_user().await?)?;
        }
        Command::Logout => {
            client.logout()?;
        }
        Command::Me => print_json(&client.current_user().await?)?,
        Command::Cases => print_json(&client.list_cases().await?)?,
        Command::Open { case_id, verify } => open(client, case_id, verify).await?,
    }
    Ok(())
}
