//! Terminal front end for the chat session manager
//!
//! Lines typed on stdin are prompts; `/cancel`, `/models a,b` and `/quit`
//! are commands. Replies stream to stdout, logs go to stderr.

use std::io::Write;
use stream_chat::protocol::Role;
use stream_chat::runtime::{self, SessionUpdate, WsConnector};
use stream_chat::{ChatConfig, Transcript};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Command {
    Prompt(String),
    Cancel,
    Models(Vec<String>),
    Quit,
}

fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed == "/cancel" {
        Command::Cancel
    } else if trimmed == "/quit" {
        Command::Quit
    } else if let Some(list) = trimmed.strip_prefix("/models") {
        Command::Models(
            list.split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToString::to_string)
                .collect(),
        )
    } else {
        Command::Prompt(line.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_chat=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ChatConfig::from_env();
    tracing::info!(
        endpoint = %config.endpoint_url(),
        models = ?config.models,
        selected = ?config.initial_selection(),
        "Chat session manager starting"
    );

    let handle = runtime::start(&config, WsConnector);
    tokio::spawn(render(handle.subscribe()));

    println!(
        "Models: {}. Type a prompt, /models a,b to select, /cancel to stop, /quit to exit.",
        config.models.join(", ")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Command::Prompt(text) => {
                handle.send(text).await?;
            }
            Command::Cancel => handle.cancel().await?,
            Command::Models(models) => handle.select_models(models).await?,
            Command::Quit => break,
        }
    }

    Ok(())
}

/// Print assistant text as it streams in
async fn render(mut updates: broadcast::Receiver<SessionUpdate>) {
    let mut shown = Transcript::new();
    loop {
        match updates.recv().await {
            Ok(SessionUpdate::Transcript(transcript)) => {
                print_delta(&shown, &transcript);
                shown = transcript;
            }
            Ok(SessionUpdate::TurnComplete { duration }) => match duration {
                Some(secs) => println!("\n[done in {secs:.1}s]"),
                None => println!("\n[done]"),
            },
            Ok(SessionUpdate::Rejected { reason }) => eprintln!("! {reason}"),
            Ok(SessionUpdate::Status(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_delta(shown: &Transcript, next: &Transcript) {
    let mut out = std::io::stdout().lock();
    for (index, message) in next.messages().iter().enumerate() {
        if message.role != Role::Assistant {
            continue;
        }
        let fresh = match shown.messages().get(index) {
            Some(old) if old.role == Role::Assistant => {
                message.content.get(old.content.len()..).unwrap_or_default()
            }
            Some(_) | None => {
                let _ = write!(out, "\nassistant: ");
                message.content.as_str()
            }
        };
        let _ = write!(out, "{fresh}");
    }
    let _ = out.flush();
}
