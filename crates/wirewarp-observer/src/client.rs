//! Reconnecting live status client
//!
//! State machine: `Connecting -> Open -> Closed`, then `Closed -> Connecting`
//! after a fixed delay. A rejected session token ends the loop in
//! `Unauthorized` and discards the token until [`LiveObserver::set_token`]
//! supplies a new one.

use futures_util::StreamExt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, http::StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use wirewarp_proto::{Agent, LiveMessage};

use crate::cache::AgentCache;
use crate::error::ObserverError;

/// Connection state as seen by the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    /// Token rejected; no further attempts until a new token is set
    Unauthorized,
}

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Live endpoint, e.g. `ws://127.0.0.1:8000/ws/dashboard`
    pub url: Url,
    /// Operator session token
    pub token: String,
    pub reconnect_delay: Duration,
}

impl ObserverConfig {
    pub fn new(url: &str, token: impl Into<String>) -> Result<Self, ObserverError> {
        Ok(Self {
            url: Url::parse(url)?,
            token: token.into(),
            reconnect_delay: Duration::from_secs(5),
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

struct Shared {
    url: Url,
    reconnect_delay: Duration,
    token: Mutex<Option<String>>,
    cache: RwLock<AgentCache>,
    state: watch::Sender<ConnectionState>,
    /// Bumped on every applied message
    changes: watch::Sender<u64>,
}

impl Shared {
    fn token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn discard_token(&self) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn apply(&self, message: LiveMessage) {
        let applied = self
            .cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .apply(message);
        if applied {
            self.changes.send_modify(|n| *n += 1);
        }
    }

    fn live_url(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Live status observer with an owned agent cache
pub struct LiveObserver {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl LiveObserver {
    pub fn new(config: ObserverConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (changes, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                url: config.url,
                reconnect_delay: config.reconnect_delay,
                token: Mutex::new(Some(config.token)),
                cache: RwLock::new(AgentCache::new()),
                state,
                changes,
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the connect loop
    ///
    /// Does nothing while a loop is already running, so at most one
    /// connection attempt is ever in flight. Must be called inside a Tokio
    /// runtime.
    pub fn start(&self) -> Result<(), ObserverError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("Live observer already running");
                return Ok(());
            }
        }
        if self.shared.token().is_none() {
            return Err(ObserverError::Unauthorized);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(self.shared.clone(), cancel.clone()));
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Stop the loop and close the connection. Safe to call repeatedly.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(running) = running {
            running.cancel.cancel();
            info!("Live observer stopped");
        }
        if *self.shared.state.borrow() != ConnectionState::Unauthorized {
            self.shared.set_state(ConnectionState::Closed);
        }
    }

    /// Replace the session token, e.g. after re-authentication
    pub fn set_token(&self, token: impl Into<String>) {
        *self.shared.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
    }

    pub fn has_token(&self) -> bool {
        self.shared.token().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Receiver that changes whenever the cache is updated
    pub fn watch_changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Current view of all agents, oldest first
    pub fn agents(&self) -> Vec<Agent> {
        self.shared
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .agents()
    }

    pub fn cache(&self) -> AgentCache {
        self.shared
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for LiveObserver {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.cancel.cancel();
            }
        }
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let Some(token) = shared.token() else {
            shared.set_state(ConnectionState::Unauthorized);
            return;
        };

        shared.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect_and_read(&shared, &token, &cancel) => result,
        };

        match result {
            Ok(()) => info!("Live channel closed"),
            Err(e) if e.is_transient() => warn!(error = %e, "Live channel error"),
            Err(e) => {
                warn!(error = %e, "Live channel rejected the session token, discarding it");
                shared.discard_token();
                shared.set_state(ConnectionState::Unauthorized);
                return;
            }
        }

        shared.set_state(ConnectionState::Closed);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.reconnect_delay) => {}
        }
    }

    shared.set_state(ConnectionState::Closed);
    debug!("Live observer loop exiting");
}

/// One connection: read frames into the cache until it drops
async fn connect_and_read(
    shared: &Shared,
    token: &str,
    cancel: &CancellationToken,
) -> Result<(), ObserverError> {
    info!(url = %shared.url, "Connecting to live channel");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(shared.live_url(token).as_str())
        .await
        .map_err(|e| match e {
            tungstenite::Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                ObserverError::Unauthorized
            }
            other => ObserverError::Channel(other.to_string()),
        })?;

    shared.set_state(ConnectionState::Open);
    info!("Live channel open");

    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match serde_json::from_str::<LiveMessage>(&text) {
                        Ok(LiveMessage::Unknown) => debug!("Ignoring unknown live message kind"),
                        Ok(message) => shared.apply(message),
                        Err(e) => debug!(error = %e, "Ignoring malformed live message"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(ObserverError::Channel(e.to_string())),
                // Binary, Ping, Pong, Frame
                Some(Ok(_)) => {}
            },
        }
    }
}
