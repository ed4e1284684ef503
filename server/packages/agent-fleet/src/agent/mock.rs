use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_fleet_error::FleetError;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::sleep;

use super::{AgentEvent, AgentRequest, AgentRuntime, AgentStream, BoxAgentStream};

const MOCK_WORD_STREAM_DELAY_MS: u64 = 30;

/// One step of a scripted agent run.
#[derive(Debug, Clone)]
pub enum MockStep {
    Emit(AgentEvent),
    Fault(String),
    Delay(Duration),
    /// Blocks until the notify is triggered.
    Wait(Arc<Notify>),
}

#[derive(Debug, Clone)]
enum MockScript {
    Echo { delay: Duration },
    Steps(Arc<Vec<MockStep>>),
    /// `open` itself fails, as when the agent binary cannot be launched.
    FailOpen(String),
}

/// In-process runtime used by `--mock-agent` and by tests. Echo mode streams
/// `mock: <prompt>` word by word; scripted mode replays fixed steps for every
/// query.
#[derive(Debug, Clone)]
pub struct MockRuntime {
    script: MockScript,
    opened: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
}

impl MockRuntime {
    pub fn echo() -> Self {
        Self::echo_with_delay(Duration::from_millis(MOCK_WORD_STREAM_DELAY_MS))
    }

    pub fn echo_with_delay(delay: Duration) -> Self {
        Self::with_script(MockScript::Echo { delay })
    }

    pub fn scripted(steps: Vec<MockStep>) -> Self {
        Self::with_script(MockScript::Steps(Arc::new(steps)))
    }

    /// Emits each fragment as a text event, then ends.
    pub fn text(fragments: &[&str]) -> Self {
        Self::scripted(
            fragments
                .iter()
                .map(|fragment| MockStep::Emit(AgentEvent::text(*fragment)))
                .collect(),
        )
    }

    pub fn failing_open(message: impl Into<String>) -> Self {
        Self::with_script(MockScript::FailOpen(message.into()))
    }

    fn with_script(script: MockScript) -> Self {
        Self {
            script,
            opened: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of streams opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of streams cancelled so far.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn echo_steps(prompt: &str, delay: Duration) -> Vec<MockStep> {
    let reply = if prompt.trim().is_empty() {
        "OK".to_string()
    } else {
        format!("mock: {prompt}")
    };
    let mut steps = Vec::new();
    for (index, word) in reply.split(' ').enumerate() {
        if !delay.is_zero() {
            steps.push(MockStep::Delay(delay));
        }
        let fragment = if index == 0 {
            word.to_string()
        } else {
            format!(" {word}")
        };
        steps.push(MockStep::Emit(AgentEvent::text(fragment)));
    }
    let words = reply.split_whitespace().count() as u64;
    steps.push(MockStep::Emit(AgentEvent::Result {
        summary: Some(reply),
        total_tokens: Some(words),
        cost_usd: Some(0.0),
    }));
    steps
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn open(&self, request: AgentRequest) -> Result<BoxAgentStream, FleetError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let steps: VecDeque<MockStep> = match &self.script {
            MockScript::Echo { delay } => echo_steps(&request.prompt, *delay).into(),
            MockScript::Steps(steps) => steps.iter().cloned().collect(),
            MockScript::FailOpen(message) => {
                return Err(FleetError::agent_fault(message.clone()));
            }
        };
        Ok(Box::new(MockStream {
            steps,
            done: false,
            cancelled: self.cancelled.clone(),
        }))
    }
}

struct MockStream {
    steps: VecDeque<MockStep>,
    done: bool,
    cancelled: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentStream for MockStream {
    async fn next_event(&mut self) -> Option<Result<AgentEvent, FleetError>> {
        while !self.done {
            match self.steps.pop_front() {
                Some(MockStep::Emit(event)) => return Some(Ok(event)),
                Some(MockStep::Fault(message)) => {
                    self.done = true;
                    return Some(Err(FleetError::agent_fault(message)));
                }
                Some(MockStep::Delay(delay)) => sleep(delay).await,
                Some(MockStep::Wait(notify)) => notify.notified().await,
                None => self.done = true,
            }
        }
        None
    }

    async fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.steps.clear();
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}
