//! WebSocket bridge between agent output and connected clients.
//!
//! Each connection gets one relay channel of capacity one. Agent events for
//! the connection's own queries, and on watch connections for queries issued
//! elsewhere, flow through it and are written as `output` envelopes before
//! the orchestrator may pull the next event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agent_fleet_error::FleetError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::agent::{AgentEvent, QueryOptions};
use crate::orchestrator::{QueryOutcome, Relay};
use crate::registry::RuntimeStatus;
use crate::router::AppState;
use crate::store::InstanceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServerEventType {
    Output,
    Status,
    Error,
    Pong,
}

/// Envelope for every server-to-client frame.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub event_type: ServerEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ServerEvent {
    fn new(event_type: ServerEventType, data: Option<Value>) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn output(event: &AgentEvent) -> Self {
        Self::new(ServerEventType::Output, serde_json::to_value(event).ok())
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self::new(ServerEventType::Status, Some(Value::String(status.into())))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ServerEventType::Error, Some(Value::String(message.into())))
    }

    pub fn pong() -> Self {
        Self::new(ServerEventType::Pong, None)
    }
}

/// Client-to-server control message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
    Status,
    Query {
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        options: QueryOptions,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Also receives output of queries started by other entry points.
    Watch,
    Interactive,
}

/// Watch connections per instance. Queries started over REST relay their
/// output to every watcher registered here.
#[derive(Debug, Default)]
pub struct WatchHub {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<String, Vec<(u64, mpsc::Sender<AgentEvent>)>>>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, mpsc::Sender<AgentEvent>)>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, instance_id: &str, sender: mpsc::Sender<AgentEvent>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers()
            .entry(instance_id.to_string())
            .or_default()
            .push((id, sender));
        id
    }

    pub fn deregister(&self, instance_id: &str, watcher_id: u64) {
        let mut watchers = self.watchers();
        if let Some(entries) = watchers.get_mut(instance_id) {
            entries.retain(|(id, _)| *id != watcher_id);
            if entries.is_empty() {
                watchers.remove(instance_id);
            }
        }
    }

    pub fn senders(&self, instance_id: &str, except: Option<u64>) -> Vec<mpsc::Sender<AgentEvent>> {
        self.watchers()
            .get(instance_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(id, _)| Some(*id) != except)
                    .map(|(_, sender)| sender.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn watcher_count(&self, instance_id: &str) -> usize {
        self.watchers().get(instance_id).map_or(0, Vec::len)
    }
}

pub(crate) async fn ws_stream(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, instance_id, ChannelMode::Watch))
}

pub(crate) async fn ws_interact(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, instance_id, ChannelMode::Interactive)
    })
}

type Sink = SplitSink<WebSocket, Message>;

struct RunningQuery {
    task: JoinHandle<Result<QueryOutcome, FleetError>>,
    cancel: CancellationToken,
}

async fn send_event(sink: &mut Sink, event: &ServerEvent) -> Result<(), FleetError> {
    let payload = serde_json::to_string(event).map_err(|_| FleetError::TransportClosed)?;
    sink.send(Message::Text(payload))
        .await
        .map_err(|_| FleetError::TransportClosed)
}

async fn join_running(
    running: &mut Option<RunningQuery>,
) -> Result<Result<QueryOutcome, FleetError>, JoinError> {
    match running {
        Some(query) => (&mut query.task).await,
        None => std::future::pending().await,
    }
}

async fn admit(state: &AppState, instance_id: &str) -> bool {
    let stored_active = match state.store().get_instance(instance_id).await {
        Ok(Some(record)) => record.status == InstanceStatus::Active,
        Ok(None) => false,
        Err(err) => {
            tracing::warn!(instance_id = %instance_id, error = %err, "instance lookup failed");
            false
        }
    };
    stored_active && state.registry().status(instance_id) == RuntimeStatus::Active
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, instance_id: String, mode: ChannelMode) {
    let (mut sink, mut stream) = socket.split();

    if !admit(&state, &instance_id).await {
        tracing::debug!(instance_id = %instance_id, "rejecting connection to inactive instance");
        let _ = send_event(
            &mut sink,
            &ServerEvent::error(format!("instance {instance_id} not found or not active")),
        )
        .await;
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let (relay_tx, mut relay_rx) = mpsc::channel::<AgentEvent>(1);
    let watcher_id = match mode {
        ChannelMode::Watch => Some(state.hub().register(&instance_id, relay_tx.clone())),
        ChannelMode::Interactive => None,
    };
    tracing::info!(instance_id = %instance_id, mode = ?mode, "client connected");

    let mut running: Option<RunningQuery> = None;
    if send_event(&mut sink, &ServerEvent::status("connected")).await.is_ok() {
        loop {
            let outgoing = tokio::select! {
                biased;
                Some(event) = relay_rx.recv() => ServerEvent::output(&event),
                joined = join_running(&mut running) => {
                    running = None;
                    match joined {
                        Ok(Ok(_)) => ServerEvent::status("completed"),
                        Ok(Err(err)) => ServerEvent::error(err.to_string()),
                        Err(err) => {
                            tracing::error!(instance_id = %instance_id, error = %err, "query task failed");
                            ServerEvent::error("query task failed")
                        }
                    }
                }
                incoming = stream.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(_))) => {
                            if send_event(&mut sink, &ServerEvent::error("binary frames are not supported")).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    };
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ping) => ServerEvent::pong(),
                        Ok(ClientMessage::Status) => {
                            let status = state.registry().status(&instance_id);
                            ServerEvent::new(ServerEventType::Status, serde_json::to_value(status).ok())
                        }
                        Ok(ClientMessage::Query { prompt, options }) => {
                            match start_query(&state, &instance_id, prompt, options, &relay_tx, watcher_id) {
                                Ok(query) => {
                                    running = Some(query);
                                    ServerEvent::status("processing")
                                }
                                Err(err) => {
                                    if !err.is_expected() {
                                        tracing::warn!(instance_id = %instance_id, error = %err, "query rejected");
                                    }
                                    ServerEvent::error(err.to_string())
                                }
                            }
                        }
                        Err(err) => ServerEvent::error(format!("invalid message: {err}")),
                    }
                }
            };
            if send_event(&mut sink, &outgoing).await.is_err() {
                break;
            }
        }
    }

    if let Some(query) = running.take() {
        query.cancel.cancel();
        drop(relay_rx);
        if let Err(err) = query.task.await {
            tracing::error!(instance_id = %instance_id, error = %err, "query task failed");
        }
    }
    if let Some(watcher_id) = watcher_id {
        state.hub().deregister(&instance_id, watcher_id);
    }
    let _ = sink.close().await;
    tracing::info!(instance_id = %instance_id, "client disconnected");
}

fn start_query(
    state: &Arc<AppState>,
    instance_id: &str,
    prompt: Option<String>,
    options: QueryOptions,
    relay_tx: &mpsc::Sender<AgentEvent>,
    watcher_id: Option<u64>,
) -> Result<RunningQuery, FleetError> {
    let prompt = prompt
        .filter(|prompt| !prompt.trim().is_empty())
        .ok_or_else(|| FleetError::InvalidRequest {
            message: "prompt is required".to_string(),
        })?;
    let guard = state.registry().acquire(instance_id)?;
    let relay = Relay::interactive(relay_tx.clone())
        .with_watchers(state.hub().senders(instance_id, watcher_id));
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let registry = state.registry().clone();
    let task = tokio::spawn(async move {
        registry
            .run_query(guard, &prompt, &options, relay, token)
            .await
    });
    Ok(RunningQuery { task, cancel })
}
