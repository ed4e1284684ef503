//! Drives one query from prompt to persisted transcript.
//!
//! The orchestrator owns the busy guard for the whole run. It creates the
//! session row, pulls agent events one at a time, relays each event before
//! pulling the next, and records the final status. Every exit path drops the
//! guard, which frees the handle.

use std::sync::Arc;
use std::time::Duration;

use agent_fleet_error::{FleetError, QueryFailure};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::agent::{AgentEvent, AgentHandle, AgentStream, BusyGuard, QueryOptions};
use crate::store::{MessageRecord, MessageRole, NewMessage, SessionRecord, SessionStatus, Store};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    pub messages: Vec<MessageRecord>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

impl QueryOutcome {
    /// Text of the final assistant message.
    pub fn response(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
            .map(|message| message.content.as_str())
    }
}

/// Where intermediate events go while a query runs.
///
/// The primary sink belongs to the connection that issued the query: if it
/// closes, the query is abandoned. Watchers are passive observers and are
/// dropped silently when they go away.
#[derive(Debug, Default)]
pub struct Relay {
    primary: Option<mpsc::Sender<AgentEvent>>,
    watchers: Vec<mpsc::Sender<AgentEvent>>,
}

impl Relay {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn interactive(sender: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            primary: Some(sender),
            watchers: Vec::new(),
        }
    }

    pub fn watch(watchers: Vec<mpsc::Sender<AgentEvent>>) -> Self {
        Self {
            primary: None,
            watchers,
        }
    }

    pub fn with_watchers(mut self, watchers: Vec<mpsc::Sender<AgentEvent>>) -> Self {
        self.watchers.extend(watchers);
        self
    }

    async fn deliver(&mut self, event: &AgentEvent) -> Result<(), FleetError> {
        if let Some(primary) = &self.primary {
            primary
                .send(event.clone())
                .await
                .map_err(|_| FleetError::TransportClosed)?;
        }
        let mut open = Vec::with_capacity(self.watchers.len());
        for watcher in self.watchers.drain(..) {
            if watcher.send(event.clone()).await.is_ok() {
                open.push(watcher);
            } else {
                tracing::debug!("watch connection went away, detaching");
            }
        }
        self.watchers = open;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Transcript {
    text: String,
    tool_calls: Vec<Value>,
    total_tokens: Option<u64>,
    cost_usd: Option<f64>,
}

impl Transcript {
    fn absorb(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Text { text } => self.text.push_str(text),
            AgentEvent::ToolUse { id, name, input } => self.tool_calls.push(json!({
                "id": id,
                "name": name,
                "input": input,
            })),
            AgentEvent::Result {
                total_tokens,
                cost_usd,
                ..
            } => {
                if total_tokens.is_some() {
                    self.total_tokens = *total_tokens;
                }
                if cost_usd.is_some() {
                    self.cost_usd = *cost_usd;
                }
            }
        }
    }
}

enum Interrupt {
    Fault(FleetError),
    Timeout,
    Closed,
    /// The instance was terminated or restarted underneath the query.
    Retired,
}

#[derive(Debug, Clone)]
pub struct QueryOrchestrator {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl QueryOrchestrator {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(
        &self,
        guard: BusyGuard,
        prompt: &str,
        options: &QueryOptions,
        mut relay: Relay,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, FleetError> {
        let deadline = Instant::now() + self.timeout;
        let instance_id = guard.handle().instance_id().to_string();

        let mut session = self
            .store
            .insert_session(SessionRecord {
                id: Uuid::new_v4().to_string(),
                instance_id: instance_id.clone(),
                status: SessionStatus::Active,
                started_at: Utc::now(),
                ended_at: None,
                total_tokens: 0,
                total_cost_usd: 0.0,
            })
            .await?;
        guard.set_session(&session.id);

        let user = match self
            .store
            .append_message(NewMessage::new(&session.id, MessageRole::User, prompt))
            .await
        {
            Ok(message) => message,
            Err(err) => {
                self.fail_session(&mut session).await;
                return Err(err);
            }
        };

        tracing::info!(instance_id = %instance_id, session_id = %session.id, "query started");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Closed),
            _ = guard.handle().retired() => Err(Interrupt::Retired),
            _ = sleep_until(deadline) => Err(Interrupt::Timeout),
            opened = guard.handle().query(&guard, prompt, options) => opened.map_err(Interrupt::Fault),
        };

        let mut transcript = Transcript::default();
        let driven = match opened {
            Ok(mut stream) => {
                let driven = drive(
                    guard.handle(),
                    stream.as_mut(),
                    &mut relay,
                    &mut transcript,
                    &cancel,
                    deadline,
                )
                .await;
                if driven.is_err() {
                    stream.cancel().await;
                }
                driven
            }
            Err(interrupt) => Err(interrupt),
        };

        if let Err(interrupt) = driven {
            self.fail_session(&mut session).await;
            return Err(self.report(interrupt, &instance_id, &session.id));
        }

        let mut assistant = NewMessage::new(&session.id, MessageRole::Assistant, transcript.text);
        assistant.tokens = transcript.total_tokens;
        assistant.cost_usd = transcript.cost_usd;
        if !transcript.tool_calls.is_empty() {
            assistant.tool_calls = Some(transcript.tool_calls);
        }
        let assistant = match self.store.append_message(assistant).await {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(
                    instance_id = %instance_id,
                    session_id = %session.id,
                    error = %err,
                    "failed to persist assistant message"
                );
                self.fail_session(&mut session).await;
                return Err(err);
            }
        };

        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        session.total_tokens = transcript.total_tokens.unwrap_or(0);
        session.total_cost_usd = transcript.cost_usd.unwrap_or(0.0);
        let session = self.store.update_session(session).await?;

        tracing::info!(
            instance_id = %instance_id,
            session_id = %session.id,
            total_tokens = session.total_tokens,
            "query completed"
        );

        Ok(QueryOutcome {
            session_id: session.id,
            status: session.status,
            messages: vec![user, assistant],
            total_tokens: session.total_tokens,
            total_cost_usd: session.total_cost_usd,
        })
    }

    async fn fail_session(&self, session: &mut SessionRecord) {
        session.status = SessionStatus::Error;
        session.ended_at = Some(Utc::now());
        if let Err(err) = self.store.update_session(session.clone()).await {
            tracing::error!(
                session_id = %session.id,
                error = %err,
                "failed to mark session as error"
            );
        }
    }

    fn report(&self, interrupt: Interrupt, instance_id: &str, session_id: &str) -> FleetError {
        let failure = match interrupt {
            Interrupt::Closed => {
                tracing::debug!(
                    instance_id = %instance_id,
                    session_id = %session_id,
                    "client went away, query abandoned"
                );
                return FleetError::TransportClosed;
            }
            Interrupt::Retired => {
                tracing::info!(
                    instance_id = %instance_id,
                    session_id = %session_id,
                    "instance terminated during query"
                );
                QueryFailure::Fault(format!("instance {instance_id} was terminated"))
            }
            Interrupt::Timeout => {
                let limit_ms = self.timeout.as_millis() as u64;
                tracing::warn!(
                    instance_id = %instance_id,
                    session_id = %session_id,
                    limit_ms,
                    "query timed out"
                );
                QueryFailure::Timeout { limit_ms }
            }
            Interrupt::Fault(err) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    session_id = %session_id,
                    error = %err,
                    "query failed"
                );
                match err {
                    FleetError::AgentFault { message, .. } => QueryFailure::Fault(message),
                    other => QueryFailure::Fault(other.to_string()),
                }
            }
        };
        FleetError::QueryFailed {
            instance_id: instance_id.to_string(),
            session_id: session_id.to_string(),
            failure,
        }
    }
}

async fn drive(
    handle: &AgentHandle,
    stream: &mut dyn AgentStream,
    relay: &mut Relay,
    transcript: &mut Transcript,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), Interrupt> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Closed),
            _ = handle.retired() => return Err(Interrupt::Retired),
            _ = sleep_until(deadline) => return Err(Interrupt::Timeout),
            next = stream.next_event() => next,
        };
        let event = match next {
            None => return Ok(()),
            Some(Err(err)) => return Err(Interrupt::Fault(err)),
            Some(Ok(event)) => event,
        };
        transcript.absorb(&event);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Closed),
            _ = handle.retired() => return Err(Interrupt::Retired),
            _ = sleep_until(deadline) => return Err(Interrupt::Timeout),
            delivered = relay.deliver(&event) => {
                delivered.map_err(|_| Interrupt::Closed)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use tokio::sync::Notify;

    use super::*;
    use crate::agent::{AgentHandle, HandleSpec, MockRuntime, MockStep};
    use crate::store::{InstanceRecord, MemoryStore};

    async fn setup(
        runtime: MockRuntime,
        timeout: Duration,
    ) -> (QueryOrchestrator, Arc<MemoryStore>, Arc<AgentHandle>) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_instance(InstanceRecord::new("a", "alpha"))
            .await
            .unwrap();
        let handle = Arc::new(AgentHandle::new(
            HandleSpec {
                instance_id: "a".to_string(),
                working_dir: PathBuf::from("."),
                env: BTreeMap::new(),
                mcp_config: None,
                system_prompt: None,
            },
            Arc::new(runtime),
        ));
        (
            QueryOrchestrator::new(store.clone(), timeout),
            store,
            handle,
        )
    }

    #[tokio::test]
    async fn fragments_concatenate_into_one_assistant_message() {
        let (orchestrator, store, handle) =
            setup(MockRuntime::text(&["Hi", " there"]), Duration::from_secs(5)).await;
        let guard = handle.try_acquire().unwrap();
        let outcome = orchestrator
            .run(
                guard,
                "hello",
                &QueryOptions::default(),
                Relay::detached(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.response(), Some("Hi there"));

        let messages = store.list_messages(&outcome.session_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "Hi there");
        assert!(messages[0].timestamp <= messages[1].timestamp);

        let session = store.get_session(&outcome.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.ended_at.is_some());
        assert!(!handle.is_busy());
        assert!(handle.current_session().is_none());
    }

    #[tokio::test]
    async fn fault_after_two_events_marks_session_error() {
        let runtime = MockRuntime::scripted(vec![
            MockStep::Emit(AgentEvent::text("one")),
            MockStep::Emit(AgentEvent::text("two")),
            MockStep::Fault("agent crashed".to_string()),
        ]);
        let (orchestrator, store, handle) = setup(runtime, Duration::from_secs(5)).await;
        let guard = handle.try_acquire().unwrap();
        let err = orchestrator
            .run(
                guard,
                "hello",
                &QueryOptions::default(),
                Relay::detached(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let session_id = match err {
            FleetError::QueryFailed {
                session_id,
                failure: QueryFailure::Fault(message),
                ..
            } => {
                assert_eq!(message, "agent crashed");
                session_id
            }
            other => panic!("unexpected error {other:?}"),
        };
        let session = store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.ended_at.is_some());
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let runtime = MockRuntime::scripted(vec![
            MockStep::Emit(AgentEvent::text("partial")),
            MockStep::Delay(Duration::from_secs(30)),
        ]);
        let (orchestrator, store, handle) = setup(runtime.clone(), Duration::from_millis(50)).await;
        let guard = handle.try_acquire().unwrap();
        let err = orchestrator
            .run(
                guard,
                "hello",
                &QueryOptions::default(),
                Relay::detached(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let FleetError::QueryFailed {
            session_id,
            failure,
            ..
        } = err
        else {
            panic!("expected query failure");
        };
        assert_eq!(failure, QueryFailure::Timeout { limit_ms: 50 });
        let session = store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(runtime.cancelled(), 1);
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn closed_interactive_relay_abandons_query() {
        let runtime = MockRuntime::text(&["a", "b", "c"]);
        let (orchestrator, store, handle) = setup(runtime.clone(), Duration::from_secs(5)).await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let guard = handle.try_acquire().unwrap();
        let err = orchestrator
            .run(
                guard,
                "hello",
                &QueryOptions::default(),
                Relay::interactive(tx),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::TransportClosed));
        let sessions = store.list_sessions(Some("a")).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Error);
        assert_eq!(runtime.cancelled(), 1);
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn closed_watcher_is_detached() {
        let (orchestrator, _store, handle) =
            setup(MockRuntime::text(&["Hi", " there"]), Duration::from_secs(5)).await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let guard = handle.try_acquire().unwrap();
        let outcome = orchestrator
            .run(
                guard,
                "hello",
                &QueryOptions::default(),
                Relay::watch(vec![tx]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.response(), Some("Hi there"));
    }

    #[tokio::test]
    async fn relay_receives_events_in_order() {
        let (orchestrator, _store, handle) =
            setup(MockRuntime::text(&["Hi", " there"]), Duration::from_secs(5)).await;
        let (tx, mut rx) = mpsc::channel(1);
        let guard = handle.try_acquire().unwrap();
        let options = QueryOptions::default();
        let run = orchestrator.run(
            guard,
            "hello",
            &options,
            Relay::interactive(tx),
            CancellationToken::new(),
        );
        let collect = async {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                seen.push(event);
            }
            seen
        };
        let (outcome, seen) = tokio::join!(run, collect);
        assert!(outcome.is_ok());
        assert_eq!(seen, vec![AgentEvent::text("Hi"), AgentEvent::text(" there")]);
    }

    #[tokio::test]
    async fn cancellation_marks_session_error() {
        let gate = Arc::new(Notify::new());
        let runtime = MockRuntime::scripted(vec![
            MockStep::Emit(AgentEvent::text("first")),
            MockStep::Wait(gate.clone()),
        ]);
        let (orchestrator, store, handle) = setup(runtime, Duration::from_secs(5)).await;
        let cancel = CancellationToken::new();
        let guard = handle.try_acquire().unwrap();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = orchestrator
            .run(
                guard,
                "hello",
                &QueryOptions::default(),
                Relay::detached(),
                cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::TransportClosed));
        let sessions = store.list_sessions(Some("a")).await.unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Error);
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn retiring_the_handle_interrupts_the_query() {
        let gate = Arc::new(Notify::new());
        let runtime = MockRuntime::scripted(vec![
            MockStep::Emit(AgentEvent::text("first")),
            MockStep::Wait(gate.clone()),
        ]);
        let (orchestrator, store, handle) = setup(runtime.clone(), Duration::from_secs(5)).await;
        let guard = handle.try_acquire().unwrap();
        let run = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .run(
                        guard,
                        "hello",
                        &QueryOptions::default(),
                        Relay::detached(),
                        CancellationToken::new(),
                    )
                    .await
            })
        };
        while runtime.opened() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.mark_inactive();

        let err = run.await.unwrap().unwrap_err();
        let FleetError::QueryFailed {
            session_id,
            failure: QueryFailure::Fault(message),
            ..
        } = err
        else {
            panic!("expected query failure, got {err:?}");
        };
        assert!(message.contains("terminated"));
        let session = store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.ended_at.is_some());
        assert_eq!(runtime.cancelled(), 1);
        assert!(!handle.is_busy());
    }
}
