use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_core::logging::{self, LogConfig, LogLevel};
use huddle_core::{
    CallConfig, CallError, CallEvent, CallHandle, ChannelSink, LocalIdentity, TransportError,
    WebSocketChannel, spawn_call,
};
use huddle_rtc::{PlaceholderMedia, RtcConfig, RtcConnectionFactory};
use tokio::sync::mpsc;

const TARGET: &str = "huddle::peer";
const JOIN_RETRY: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "huddle-peer")]
#[command(about = "Headless huddle call participant")]
struct Cli {
    /// Relay WebSocket URL (defaults to HUDDLE_SIGNALING_URL)
    #[arg(long)]
    relay: Option<String>,

    #[arg(long)]
    user_id: String,

    /// Display name; the user id when omitted
    #[arg(long)]
    username: Option<String>,

    /// Offer audio only
    #[arg(long)]
    audio_only: bool,

    /// STUN server URL, repeatable; replaces the default server
    #[arg(long = "stun")]
    stun_servers: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = CallConfig::from_env();
    if let Some(relay) = cli.relay.clone() {
        config.signaling_url = relay;
    }
    let mut rtc = RtcConfig::default();
    if !cli.stun_servers.is_empty() {
        rtc.ice_servers = cli.stun_servers.clone();
    }

    let username = cli.username.clone().unwrap_or_else(|| cli.user_id.clone());
    let identity = LocalIdentity::new(cli.user_id.as_str(), username);
    let (channel, channel_events) = WebSocketChannel::connect(
        &config.signaling_url,
        identity.clone(),
        config.channel_retry_delay,
    )
    .with_context(|| format!("invalid relay url {}", config.signaling_url))?;
    let factory = RtcConnectionFactory::new(rtc).context("failed to build webrtc api")?;
    let (sink, mut events) = ChannelSink::new();

    let handle = spawn_call(
        identity,
        &config,
        channel,
        channel_events,
        Arc::new(factory),
        Arc::new(PlaceholderMedia::new(true, !cli.audio_only)),
        Arc::new(sink),
    );
    tracing::info!(target = TARGET, relay = %config.signaling_url, user = %cli.user_id, "connecting");

    let interrupted = tokio::select! {
        joined = join_when_open(&handle) => {
            joined?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        handle.shutdown().await;
        return Ok(());
    }
    tracing::info!(target = TARGET, "joined call; press ctrl-c to leave");

    run_until_interrupted(&mut events).await;

    if let Err(err) = handle.leave().await {
        tracing::warn!(target = TARGET, error = %err, "leave could not be announced");
    }
    handle.shutdown().await;
    Ok(())
}

/// Retries `join` until the relay connection is up.
async fn join_when_open(handle: &CallHandle) -> Result<()> {
    loop {
        match handle.join().await {
            Ok(()) => return Ok(()),
            Err(CallError::Transport(TransportError::NotOpen)) => {
                tokio::time::sleep(JOIN_RETRY).await;
            }
            Err(err) => return Err(err).context("failed to join call"),
        }
    }
}

async fn run_until_interrupted(events: &mut mpsc::UnboundedReceiver<CallEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => return,
            },
            _ = tokio::signal::ctrl_c() => return,
        }
    }
}

fn log_event(event: &CallEvent) {
    match event {
        CallEvent::RemoteStreamAdded { peer, stream } => {
            tracing::info!(target = TARGET, peer = %peer, tracks = stream.len(), "remote stream added")
        }
        CallEvent::RemoteStreamRemoved { peer } => {
            tracing::info!(target = TARGET, peer = %peer, "remote stream removed")
        }
        CallEvent::ParticipantJoined { peer } => {
            tracing::info!(target = TARGET, peer = %peer, "participant joined")
        }
        CallEvent::ParticipantLeft { peer } => {
            tracing::info!(target = TARGET, peer = %peer, "participant left")
        }
        CallEvent::UsersUpdated { users } => {
            tracing::debug!(target = TARGET, count = users.len(), "users updated")
        }
        CallEvent::UserOnline { peer, username } => {
            tracing::info!(target = TARGET, peer = %peer, username = %username, "user online")
        }
        CallEvent::ChatMessage(message) => tracing::info!(
            target = TARGET,
            from = %message.sender_username,
            text = %message.content,
            "chat"
        ),
        CallEvent::ChatHistory(messages) => {
            tracing::info!(target = TARGET, count = messages.len(), "chat history")
        }
        CallEvent::TypingChanged {
            peer, is_typing, ..
        } => tracing::debug!(target = TARGET, peer = %peer, is_typing, "typing"),
        CallEvent::PeerConnectionState { peer, state } => {
            tracing::info!(target = TARGET, peer = %peer, state = ?state, "connection state")
        }
    }
}
