//! `relay chat`, `relay resume`, `relay cancel`: a terminal client for a
//! running relay.

use std::io::Write;

use anyhow::{Context, Result};
use chat_client::{ChatSession, ClientError, RelayClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Connection options shared by the client commands.
pub struct Connection {
    pub url: String,
    pub token: Option<String>,
    pub username: Option<String>,
}

async fn connect(conn: &Connection) -> Result<RelayClient> {
    let mut client = RelayClient::new(&conn.url)?;
    if let Some(token) = &conn.token {
        client = client.with_token(token.clone());
    } else if let Some(username) = &conn.username {
        let password = super::prompt_line("Password: ").await?;
        client
            .login(username, &password)
            .await
            .context("Login failed")?;
    }
    Ok(client)
}

/// Open a session, resume any reply still streaming, then either send
/// `message` or read prompts from stdin until EOF.
pub async fn chat_command(
    conn: &Connection,
    session_id: Option<String>,
    model: Option<String>,
    message: Option<String>,
) -> Result<()> {
    let client = connect(conn).await?;
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let initial = match client.session(&session_id).await? {
        Some(detail) => detail.session.messages,
        None => Vec::new(),
    };
    let model = model.or_else(|| initial.iter().rev().find_map(|m| m.model.clone()));
    let model = model.unwrap_or_default();
    eprintln!("[session {session_id}]");

    let mut session = ChatSession::new(&session_id, &model, initial, true);
    if let Some(reply) = session.mount(&client, print_delta).await? {
        finish_line(reply.stop_reason.as_deref());
    }

    if let Some(message) = message {
        return send(&mut session, &client, &message).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = send(&mut session, &client, line).await {
            eprintln!("[error: {e:#}]");
        }
    }
    Ok(())
}

/// Attach to a session's in-flight reply and print it.
///
/// Without `after` this is the same one-shot resume check `relay chat` runs on
/// start; with it, only fragments past that sequence number are replayed.
pub async fn resume_command(conn: &Connection, session_id: &str, after: Option<u64>) -> Result<()> {
    let client = connect(conn).await?;
    let detail = client
        .session(session_id)
        .await?
        .with_context(|| format!("No such session: {session_id}"))?;

    let mut session = ChatSession::new(session_id, "", detail.session.messages, true);
    let reply = match after {
        None => session.mount(&client, print_delta).await?,
        Some(after) => match client.resume(session_id, Some(after)).await? {
            Some(stream) => Some(session.drive(stream, print_delta).await?),
            None => None,
        },
    };
    match reply {
        Some(reply) => finish_line(reply.stop_reason.as_deref()),
        None => eprintln!("[nothing to resume]"),
    }
    Ok(())
}

pub async fn cancel_command(conn: &Connection, session_id: &str) -> Result<()> {
    let client = connect(conn).await?;
    if client.cancel(session_id).await? {
        eprintln!("[cancel requested]");
    } else {
        eprintln!("[no reply is streaming for {session_id}]");
    }
    Ok(())
}

async fn send(session: &mut ChatSession, client: &RelayClient, text: &str) -> Result<()> {
    match session.submit(client, text, print_delta).await {
        Ok(reply) => {
            finish_line(reply.stop_reason.as_deref());
            Ok(())
        }
        Err(ClientError::Generation { message, kind }) => {
            println!();
            debug!(?kind, "Generation ended without a reply");
            eprintln!("[reply failed: {message}]");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_delta(delta: &str) {
    print!("{delta}");
    let _ = std::io::stdout().flush();
}

fn finish_line(stop_reason: Option<&str>) {
    println!();
    if stop_reason == Some("cancelled") {
        eprintln!("[cancelled]");
    }
}
