//! Inbound event listener
//!
//! The robot program opens its own TCP connection back to the cell host and
//! writes one token per line (`COUNT` after each sorted item). Every line is
//! broadcast to subscribers; transport trouble is broadcast as a diagnostic
//! instead of tearing the listener down.

use crate::persistence::RunStore;
use crate::{CellError, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerEvent {
    Line { peer: SocketAddr, line: String },
    Diagnostic { message: String },
}

/// Item tokens understood by the counter bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemToken {
    Accepted,
    Rejected,
}

impl ItemToken {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_uppercase().as_str() {
            "COUNT" | "ACCEPTED" => Some(ItemToken::Accepted),
            "REJECTED" => Some(ItemToken::Rejected),
            _ => None,
        }
    }
}

struct ActiveListener {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct EventListener {
    events: broadcast::Sender<ListenerEvent>,
    active: Mutex<Option<ActiveListener>>,
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListener {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            active: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    /// Bind and start accepting; a second call while listening returns the
    /// existing address
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            debug!("Event listener already running on {}", existing.addr);
            return Ok(existing.addr);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| CellError::Connect(format!("Failed to bind event port {}: {}", port, e)))?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, self.events.clone(), shutdown_rx));

        info!("Event listener accepting on {}", addr);
        *active = Some(ActiveListener {
            addr,
            shutdown,
            handle,
        });
        Ok(addr)
    }

    pub async fn is_listening(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().await.as_ref().map(|a| a.addr)
    }

    /// Stop accepting; open connections finish when their peers close
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        let _ = active.shutdown.send(true);
        if let Err(e) = active.handle.await {
            warn!("Event accept loop ended abnormally: {}", e);
        }
        info!("Event listener on {} stopped", active.addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: broadcast::Sender<ListenerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Robot event connection from {}", peer);
                    tokio::spawn(handle_connection(socket, peer, events.clone()));
                }
                Err(e) => {
                    let _ = events.send(ListenerEvent::Diagnostic {
                        message: format!("Accept failed: {}", e),
                    });
                    sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, events: broadcast::Sender<ListenerEvent>) {
    let mut lines = BufReader::new(socket).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = events.send(ListenerEvent::Line {
                    peer,
                    line: line.to_string(),
                });
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(ListenerEvent::Diagnostic {
                    message: format!("Read from {} failed: {}", peer, e),
                });
                break;
            }
        }
    }
    debug!("Robot event connection from {} closed", peer);
}

/// Feed item tokens from the listener into the store's counters
pub fn spawn_counter_bridge(
    mut events: broadcast::Receiver<ListenerEvent>,
    store: Arc<dyn RunStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Counter bridge missed {} events", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                ListenerEvent::Line { line, .. } => match ItemToken::parse(&line) {
                    Some(token) => {
                        let accepted = token == ItemToken::Accepted;
                        match store.increment_counter(accepted).await {
                            Ok(counter) => debug!("Counter now {:?}", counter),
                            Err(e) => warn!("Failed to update counter: {}", e),
                        }
                    }
                    None => debug!("Ignoring event token {:?}", line),
                },
                ListenerEvent::Diagnostic { message } => warn!("Event listener: {}", message),
            }
        }
    })
}
