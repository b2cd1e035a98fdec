use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;

use certpilot::core::service::DEFAULT_RENEWAL_WINDOW_DAYS;
use certpilot::{IssuanceService, Settings};

const STATUS_POLL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(author, version, about = "ACME DNS-01 certificate issuance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a certificate and wait for the outcome (Ctrl-C cancels)
    Issue {
        #[arg(long, env = "CERTPILOT_TENANT")]
        tenant: String,
        #[arg(long)]
        domain: String,
        #[arg(long, env = "CERTPILOT_CONTACT_EMAIL")]
        email: String,
    },
    /// Show one request
    Status { id: String },
    /// List a tenant's requests, newest first
    List {
        #[arg(long, env = "CERTPILOT_TENANT")]
        tenant: String,
    },
    /// Install an issued certificate into one or more targets under CERTPILOT_INSTALL_DIR
    Install {
        id: String,
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
    },
    /// Cancel a request if it is running and remove it
    Delete { id: String },
    /// Mark certificates past their expiry date as expired
    Expire,
    /// List certificates due for renewal and mark them scheduled
    Renewals {
        #[arg(long, default_value_t = DEFAULT_RENEWAL_WINDOW_DAYS)]
        days: i64,
    },
    /// Start a replacement issuance for an issued certificate
    Renew { id: String },
    /// Fail requests left unfinished by a previous run and remove their challenge records
    Recover,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn issue(service: &IssuanceService, tenant: &str, domain: &str, email: &str) -> Result<()> {
    let request = service
        .submit(tenant, domain, email)
        .await
        .map_err(|err| anyhow!(err))?;
    info!("request {} submitted for {}", request.id, request.domain);

    let wait = service.wait_until_settled(&request.id, STATUS_POLL);
    tokio::pin!(wait);
    let settled = loop {
        tokio::select! {
            settled = &mut wait => break settled?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                let outcome = service.cancel(&request.id);
                warn!("cancel requested for {}: {outcome:?}", request.id);
            }
        }
    };
    print_json(&settled)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let service = IssuanceService::from_settings(&settings)?;

    match cli.command {
        Commands::Issue {
            tenant,
            domain,
            email,
        } => issue(&service, &tenant, &domain, &email).await,
        Commands::Status { id } => {
            let request = service
                .status(&id)?
                .ok_or_else(|| anyhow!("certificate request {id} not found"))?;
            print_json(&request)
        }
        Commands::List { tenant } => print_json(&service.list(&tenant)?),
        Commands::Install { id, targets } => print_json(&service.install(&id, &targets).await?),
        Commands::Delete { id } => print_json(&service.delete(&id).await?),
        Commands::Expire => print_json(&service.expire_due(Utc::now())?),
        Commands::Renewals { days } => {
            let window = chrono::Duration::try_days(days)
                .ok_or_else(|| anyhow!("renewal window of {days} days is out of range"))?;
            print_json(&service.schedule_renewals(Utc::now(), window)?)
        }
        Commands::Renew { id } => {
            let renewal = service.renew(&id).await?;
            info!("request {} renews {id}", renewal.id);
            let settled = service.wait_until_settled(&renewal.id, STATUS_POLL).await?;
            print_json(&settled)
        }
        Commands::Recover => print_json(&service.recover_interrupted().await?),
    }
}
