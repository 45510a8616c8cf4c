use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{load_settings, ChatSession, ConnectionState, SessionDependencies};
use shared::domain::{ConversationId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the configured API base URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Reuse the persisted credential instead of logging in.
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    message: Option<String>,
    /// Send `--message` privately to this user id.
    #[arg(long)]
    to: Option<i64>,
    #[arg(long, default_value_t = 5)]
    listen_secs: u64,
    #[arg(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.server_url {
        settings.api_url = url;
    }
    let deps = SessionDependencies::from_settings(&settings)?;

    let session = if args.resume {
        ChatSession::resume(&settings, deps)?
    } else {
        let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref()) else {
            bail!("--email and --password are required unless --resume is given");
        };
        ChatSession::login(&settings, deps, email, password).await?
    };

    tokio::time::timeout(
        settings.connect_timeout,
        session.realtime().wait_for_state(ConnectionState::Authenticated),
    )
    .await??;

    if let Some(body) = args.message {
        match args.to {
            Some(user) => {
                session.load_private_history(UserId(user))?;
                session.send_private(UserId(user), body)?;
            }
            None => session.send_public(body)?,
        }
    }

    let mut notices = session.subscribe_notices();
    let listen = tokio::time::sleep(Duration::from_secs(args.listen_secs));
    tokio::pin!(listen);
    loop {
        tokio::select! {
            _ = &mut listen => break,
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{notice:?}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notices skipped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let view = session.snapshot();
    if let Some(me) = view.me() {
        println!("Signed in as {} ({})", me.name, me.id);
    }
    println!("Online: {}", view.presence().len());
    for conversation in view.conversations() {
        let title = match conversation.id() {
            ConversationId::Public => "public".to_string(),
            ConversationId::Private(user) => format!("private with {user}"),
        };
        println!("== {title} ({} messages)", conversation.len());
        for message in conversation.messages() {
            println!(
                "[{}] {}: {}",
                message.timestamp.format("%H:%M:%S"),
                message.sender_name,
                message.body
            );
        }
    }

    if args.logout {
        session.logout().await;
        println!("Logged out");
    }
    Ok(())
}
