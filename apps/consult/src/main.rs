use std::{collections::HashSet, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ConnectionStatus, SendOutcome, SyncEngine};
use shared::{domain::ConversationId, protocol::Message};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `server_url` from consult.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, conflicts_with = "guest_id")]
    token: Option<String>,
    #[arg(long)]
    guest_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the conversations visible to the current identity.
    Threads {
        #[arg(long)]
        limit: Option<u32>,
        /// Keep following the cursor until the last page.
        #[arg(long)]
        all: bool,
    },
    /// Print a conversation's history, then stream new messages until Ctrl-C.
    Tail { conversation_id: String },
    /// Post one message and exit.
    Send {
        conversation_id: String,
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if let Some(token) = cli.token {
        settings.token = Some(token);
        settings.guest_id = None;
    }
    if let Some(guest_id) = cli.guest_id {
        settings.token = None;
        settings.guest_id = Some(guest_id);
    }
    if let Command::Threads {
        limit: Some(limit), ..
    } = &cli.command
    {
        settings.roster_page_size = *limit;
    }

    let engine = SyncEngine::from_settings(&settings)?;
    let result = match cli.command {
        Command::Threads { all, .. } => list_threads(&engine, all).await,
        Command::Tail { conversation_id } => tail(&engine, conversation_id.into()).await,
        Command::Send {
            conversation_id,
            body,
        } => send(&engine, conversation_id.into(), body).await,
    };
    engine.shutdown().await;
    result
}

async fn list_threads(engine: &SyncEngine, all: bool) -> Result<()> {
    engine.load_threads().await?;
    if all {
        while engine.load_more_threads().await?.is_some() {}
    }
    let roster = engine.roster().snapshot();
    for entry in &roster.items {
        println!(
            "{}\t{}\t{}",
            entry.id,
            entry.updated_at.to_rfc3339(),
            entry.title.as_deref().unwrap_or("(untitled)")
        );
    }
    if roster.has_more() {
        println!("... more threads available (use --all)");
    }
    Ok(())
}

async fn tail(engine: &SyncEngine, conversation_id: ConversationId) -> Result<()> {
    if let Err(err) = engine.open_conversation(&conversation_id).await {
        warn!(error = %err, "history unavailable; streaming live messages only");
    }
    let mut rx = engine.subscribe(&conversation_id);
    let mut printed = HashSet::new();
    let mut status = ConnectionStatus::Idle;
    let mut read_only = false;

    loop {
        {
            let state = rx.borrow_and_update();
            for message in &state.messages {
                if printed.insert(message.id.clone()) {
                    print_message(message);
                }
            }
            if state.status != status {
                status = state.status;
                eprintln!("-- channel {status}");
            }
            if state.read_only != read_only {
                read_only = state.read_only;
                eprintln!("-- read-only: {read_only}");
            }
            if let Some(err) = &state.last_error {
                if status == ConnectionStatus::Error {
                    eprintln!("-- server error {:?}: {}", err.code, err.message);
                }
            }
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn send(engine: &SyncEngine, conversation_id: ConversationId, body: String) -> Result<()> {
    engine.open_conversation(&conversation_id).await?;
    let mut rx = engine.subscribe(&conversation_id);
    let opened = matches!(
        tokio::time::timeout(OPEN_TIMEOUT, rx.wait_for(|state| state.status.is_open())).await,
        Ok(Ok(_))
    );
    if !opened {
        bail!("channel for {conversation_id} did not open within {OPEN_TIMEOUT:?}");
    }

    match engine.send(&conversation_id, body).await {
        SendOutcome::Delivered => println!("sent"),
        SendOutcome::Dropped => bail!("channel closed before the message could be sent"),
    }
    engine.close_conversation(&conversation_id).await;
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "[{}] {} ({:?}): {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender.id,
        message.sender.role,
        message.body
    );
}
