mod api;

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use api::{format_message, ApiClient, EventRenderer};

const HISTORY_LIMIT: usize = 30;

/// Who this terminal speaks as, and where.
struct Identity {
    group_id: String,
    user_id: String,
}

enum Command {
    Say(String),
    Reply { message_id: String, content: String },
    History,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "/quit" || line == "/exit" {
        return Some(Command::Quit);
    }
    if line == "/history" {
        return Some(Command::History);
    }
    if let Some(rest) = line.strip_prefix("/reply ") {
        let (message_id, content) = rest.trim().split_once(' ')?;
        let content = content.trim();
        if content.is_empty() {
            return None;
        }
        return Some(Command::Reply {
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
    }
    Some(Command::Say(line.to_string()))
}

/// Use `ABAO_GROUP_ID`/`ABAO_USER_ID` when set, otherwise register a fresh
/// user (named by the first argument) in a fresh group.
async fn resolve_identity(client: &ApiClient) -> Result<Identity> {
    let env = |key: &str| {
        std::env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let nickname = std::env::args().nth(1).unwrap_or_else(|| "guest".to_string());

    let group_id = match env("ABAO_GROUP_ID") {
        Some(id) => id,
        None => {
            let id = client.create_group("terminal").await?;
            println!("Created group {}", id);
            id
        }
    };
    let user_id = match env("ABAO_USER_ID") {
        Some(id) => id,
        None => {
            let id = client.create_user(&nickname).await?;
            println!("Registered as {} ({})", nickname, id);
            id
        }
    };
    client.join_group(&group_id, &user_id).await?;
    Ok(Identity { group_id, user_id })
}

/// Blocking stdin reader feeding the async loop.
fn spawn_stdin_reader() -> flume::Receiver<String> {
    let (tx, rx) = flume::unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,abao=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = ApiClient::from_env();
    tracing::info!("Backend API: {}", client.base_url());
    if !client.has_token() {
        tracing::warn!(
            "ABAO_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }

    let identity = resolve_identity(&client)
        .await
        .context("Failed to join a group")?;

    for message in client.list_messages(&identity.group_id, HISTORY_LIMIT).await? {
        println!("{}", format_message(&message));
    }
    println!("Type to chat, /reply <id> <text>, /history, /quit. Mention @AI to call A宝.");

    let (event_tx, event_rx) = flume::unbounded();
    tokio::spawn(
        client
            .clone()
            .stream_group_events(identity.group_id.clone(), event_tx),
    );
    let lines = spawn_stdin_reader();
    let mut renderer = EventRenderer::new();
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = event_rx.recv_async() => {
                let Ok(event) = event else { break };
                if let Some(text) = renderer.render(&event) {
                    print!("{}", text);
                    stdout.flush().ok();
                }
            }
            line = lines.recv_async() => {
                let Ok(line) = line else { break };
                let Some(command) = parse_command(&line) else { continue };
                let result = match command {
                    Command::Quit => break,
                    Command::History => client
                        .list_messages(&identity.group_id, HISTORY_LIMIT)
                        .await
                        .map(|messages| {
                            for message in messages {
                                println!("{}  #{}", format_message(&message), message.id);
                            }
                        }),
                    Command::Say(content) => client
                        .send_message(&identity.group_id, &identity.user_id, &content, None)
                        .await
                        .map(|_| ()),
                    Command::Reply { message_id, content } => client
                        .send_message(
                            &identity.group_id,
                            &identity.user_id,
                            &content,
                            Some(&message_id),
                        )
                        .await
                        .map(|_| ()),
                };
                if let Err(error) = result {
                    tracing::error!("{:#}", error);
                }
            }
        }
    }

    Ok(())
}
