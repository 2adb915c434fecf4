use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use field_sync_proto::{FieldAck, LockRequest, UpdateRequest};
use field_sync_sdk::{Backoff, FieldSyncApi, FieldSyncClient, PollerConfig};
use tokio::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "field-sync-server")]
#[command(about = "Field lock and delta-feed server, plus a debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server (default when no command is given)
    Serve,

    /// Talk to a running server
    Debug {
        /// Base URL the /fields routes hang off
        #[arg(short, long, default_value = "http://localhost:8090")]
        url: String,

        /// Session code to operate on
        #[arg(short, long)]
        session: String,

        /// Client id to act as; generated when omitted
        #[arg(long, env = "FIELD_SYNC_USER")]
        user: Option<String>,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Acquire or refresh the lease on a field
    Lock { field: String },

    /// Release the lease on a field
    Unlock { field: String },

    /// Write a value to a field
    Update { field: String, value: String },

    /// Fetch one delta
    Poll {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Follow the session and print every change until interrupted
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn print_ack(action: &str, ack: &FieldAck) -> Result<()> {
    println!("{action}: {}", serde_json::to_string(ack)?);
    if !ack.success {
        bail!("{action} rejected: {}", ack.message);
    }
    Ok(())
}

pub async fn run_debug_client(
    url: String,
    session: String,
    user: Option<String>,
    command: DebugCommands,
) -> Result<()> {
    let client = FieldSyncClient::new(url);
    let user = user.unwrap_or_else(field_sync_sdk::agent::generate_client_id);
    debug!(base = %client.base_url(), %session, %user, "debug client");

    match command {
        DebugCommands::Lock { field } => {
            let ack = client.lock(&LockRequest::new(&session, field, &user)).await?;
            print_ack("lock", &ack)
        }
        DebugCommands::Unlock { field } => {
            let ack = client
                .unlock(&LockRequest::new(&session, field, &user))
                .await?;
            print_ack("unlock", &ack)
        }
        DebugCommands::Update { field, value } => {
            let ack = client
                .update(&UpdateRequest::new(&session, field, value, &user))
                .await?;
            print_ack("update", &ack)
        }
        DebugCommands::Poll { since } => {
            let updates = client.updates(&session, since).await?;
            println!("{}", serde_json::to_string_pretty(&updates)?);
            Ok(())
        }
        DebugCommands::Watch { seconds } => watch(client, session, seconds).await,
    }
}

async fn watch(client: FieldSyncClient, session: String, seconds: Option<u64>) -> Result<()> {
    let mut backoff = Backoff::new(PollerConfig::default());
    let mut since = 0;
    let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    loop {
        match client.updates(&session, since).await {
            Ok(updates) if updates.is_empty() => {
                since = updates.last_update;
                backoff.on_idle();
            }
            Ok(updates) => {
                for (field, info) in &updates.fields {
                    let value = updates.values.get(field).map(String::as_str).unwrap_or("");
                    println!(
                        "{field} = {value:?} (by {}, locked by {})",
                        info.user_id,
                        info.locked_by.as_deref().unwrap_or("nobody")
                    );
                }
                since = updates.last_update;
                backoff.on_changes();
            }
            Err(err) => {
                eprintln!("poll failed: {err}");
                backoff.on_error();
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(backoff.delay()) => {}
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            break;
        }
    }
    Ok(())
}
