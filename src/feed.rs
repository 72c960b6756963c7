//! Feed connection lifecycle.
//!
//! DISCONNECTED → CONNECTING → OPEN → CLOSED
//!
//! One websocket subscription per run. There is no reconnect: once the
//! connection closes (or fails) `run` returns and the caller decides what
//! happens next.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use futures_util::StreamExt;
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::event::{Event, EventError};
use crate::player::{Jingle, Player};
use crate::policy::NotificationPolicy;
use crate::store::EventStore;

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

/// How long to wait for the server to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

pub struct FeedConnection {
    url: String,
    env_name: &'static str,
    quiet: bool,
    close_timeout: Duration,
    state: ConnectionState,
    policy: Arc<NotificationPolicy>,
    store: Arc<dyn EventStore>,
    player: Arc<dyn Player>,
}

impl FeedConnection {
    pub fn new(
        url: impl Into<String>,
        env_name: &'static str,
        quiet: bool,
        policy: Arc<NotificationPolicy>,
        store: Arc<dyn EventStore>,
        player: Arc<dyn Player>,
    ) -> Self {
        Self {
            url: url.into(),
            env_name,
            quiet,
            close_timeout: CLOSE_TIMEOUT,
            state: ConnectionState::Disconnected,
            policy,
            store,
            player,
        }
    }

    #[cfg(test)]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("State: {} → {}", self.state, next);
        self.state = next;
    }

    /// Connect and receive until the server closes, the transport fails, or
    /// `shutdown` resolves. After a shutdown the server gets `close_timeout` to
    /// finish the close handshake before the socket is dropped. In-flight
    /// notification tasks are not awaited.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<ConnectionState, FeedError>
    where
        F: Future<Output = ()>,
    {
        info!("{}", "-".repeat(50));
        info!("Environment: {}", self.env_name);
        info!("Connecting to {}...", self.url);
        self.transition(ConnectionState::Connecting);

        let started = Instant::now();
        let (mut ws, _) = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("WebSocket error: {e}");
                self.on_closed(started.elapsed(), None);
                return Err(e.into());
            }
        };

        self.transition(ConnectionState::Open);
        info!(
            "Connected successfully at {}!",
            Local::now().format(TIMESTAMP_FORMAT)
        );
        info!("Receiving messages... (Press Ctrl+C to stop)");
        info!("{}", "-".repeat(50));
        self.player.play_jingle(Jingle::Connected);

        tokio::pin!(shutdown);
        let close_wait = tokio::time::sleep(self.close_timeout);
        tokio::pin!(close_wait);
        let mut stopping = false;
        let mut close_frame = None;

        let result = loop {
            tokio::select! {
                _ = &mut shutdown, if !stopping => {
                    info!("Stopping receiver...");
                    stopping = true;
                    close_wait
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.close_timeout);
                    if let Err(e) = ws.close(None).await {
                        warn!("Failed to send close frame: {e}");
                        break Ok(());
                    }
                }
                _ = &mut close_wait, if stopping => {
                    warn!("No close reply within {:?}, dropping connection", self.close_timeout);
                    break Ok(());
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle_message(&text) {
                            error!("{e}");
                            error!("Raw message: {text}");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => close_frame = frame,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {e}");
                        break Err(FeedError::from(e));
                    }
                    None => break Ok(()),
                }
            }
        };

        self.on_closed(started.elapsed(), close_frame);
        result.map(|()| self.state)
    }

    /// Parse one message and hand it to persistence and notification without
    /// waiting for either.
    pub fn handle_message(&self, text: &str) -> Result<(), EventError> {
        let event = Arc::new(Event::parse(text)?);

        info!(
            "[{}] Received \"{}\" message",
            Local::now().format(TIMESTAMP_FORMAT),
            event.name()
        );
        if !self.quiet {
            match serde_json::to_string_pretty(&event.raw) {
                Ok(pretty) => info!("\n{pretty}"),
                Err(e) => warn!("Failed to format message: {e}"),
            }
            info!("{}", "-".repeat(50));
        }

        let store = self.store.clone();
        let stored = event.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert(&stored).await {
                error!("Failed to store event {}: {e}", stored.id);
            }
        });

        let policy = self.policy.clone();
        tokio::spawn(async move {
            if let Err(e) = policy.on_event(&event).await {
                error!("Notification failed for \"{}\": {e}", event.name());
            }
        });

        Ok(())
    }

    fn on_closed(&mut self, connected: Duration, frame: Option<CloseFrame<'static>>) {
        self.transition(ConnectionState::Closed);

        info!(
            "[{}] Connection closed after {}",
            Local::now().format(TIMESTAMP_FORMAT),
            format_duration(connected)
        );
        let (code, reason) = match frame {
            Some(frame) => {
                let reason = if frame.reason.is_empty() {
                    "N/A".to_string()
                } else {
                    frame.reason.to_string()
                };
                (u16::from(frame.code).to_string(), reason)
            }
            None => ("N/A".to_string(), "N/A".to_string()),
        };
        info!("Close code: {code}, Reason: {reason}");
        self.player.play_jingle(Jingle::Disconnected);
    }
}

fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        let total = duration.as_secs();
        let (hours, minutes, secs) = (total / 3600, (total / 60) % 60, total % 60);
        if hours == 0 {
            format!("{minutes}m {secs}s")
        } else {
            format!("{hours}h {minutes}m {secs}s")
        }
    }
}
