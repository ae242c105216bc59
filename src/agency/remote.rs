//! Agency-side proxy for a registered agent.
//!
//! Each call becomes a numbered request on the agent's connection. The
//! connection task routes replies back to the waiting caller through
//! [`RemoteAgent::complete`] and progress events to the listener of the
//! request they belong to through [`RemoteAgent::dispatch_event`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::protocol::{AgencyMessage, AgentRequest, MessageWriter, ReplyOutcome};
use super::{AgencyError, AgencyResult};
use crate::package::TestPackage;
use crate::result::{TestEngineResult, TestEvent, TestEventListener, TestFilter};

/// Write half of an agent connection.
pub type AgentWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Pending {
    reply: oneshot::Sender<ReplyOutcome>,
    listener: Option<Arc<dyn TestEventListener>>,
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<u64, Pending>,
    closed: bool,
}

/// A connected agent, as seen by the agency.
pub struct RemoteAgent {
    id: Uuid,
    writer: tokio::sync::Mutex<MessageWriter<AgentWriter>>,
    next_request: AtomicU64,
    pending: Mutex<PendingTable>,
}

impl fmt::Debug for RemoteAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAgent").field("id", &self.id).finish()
    }
}

impl RemoteAgent {
    pub fn new(id: Uuid, writer: AgentWriter) -> Self {
        Self {
            id,
            writer: tokio::sync::Mutex::new(MessageWriter::new(writer)),
            next_request: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
        }
    }

    /// An agent whose requests go nowhere.
    #[cfg(test)]
    pub(crate) fn detached(id: Uuid) -> Arc<Self> {
        Arc::new(Self::new(id, Box::new(tokio::io::sink())))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.pending().closed
    }

    /// Sends a request and waits for its reply.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed before the reply arrives, or the
    /// agent replies with an error.
    pub async fn request(
        &self,
        request: AgentRequest,
        listener: Option<Arc<dyn TestEventListener>>,
    ) -> AgencyResult<ReplyOutcome> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending();
            if pending.closed {
                return Err(AgencyError::ConnectionClosed);
            }
            pending.requests.insert(id, Pending { reply: tx, listener });
        }

        debug!("Agent {}: request {} {}", self.id, id, request.name());
        let sent = self
            .writer
            .lock()
            .await
            .send(&AgencyMessage::Request { id, request })
            .await;
        if let Err(e) = sent {
            self.pending().requests.remove(&id);
            return Err(e.into());
        }

        match rx.await {
            Ok(ReplyOutcome::Error { message }) => Err(AgencyError::Remote(message)),
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(AgencyError::ConnectionClosed),
        }
    }

    /// Delivers a reply to the caller waiting on `request`.
    pub fn complete(&self, request: u64, outcome: ReplyOutcome) {
        match self.pending().requests.remove(&request) {
            Some(pending) => {
                let _ = pending.reply.send(outcome);
            }
            None => debug!("Agent {}: reply to unknown request {}", self.id, request),
        }
    }

    /// Forwards a progress event to the listener of `request`.
    pub fn dispatch_event(&self, request: u64, event: &TestEvent) {
        let listener = self
            .pending()
            .requests
            .get(&request)
            .and_then(|p| p.listener.clone());

        if let Some(listener) = listener {
            listener.on_event(event);
        }
    }

    /// Marks the connection closed and fails every outstanding request.
    pub fn close(&self) {
        let mut pending = self.pending();
        pending.closed = true;
        let dropped = pending.requests.len();
        pending.requests.clear();
        if dropped > 0 {
            debug!("Agent {}: {} requests failed by disconnect", self.id, dropped);
        }
    }

    pub async fn load(&self, package: &TestPackage) -> AgencyResult<TestEngineResult> {
        let outcome = self
            .request(
                AgentRequest::Load {
                    package: package.clone(),
                },
                None,
            )
            .await?;
        expect_result(outcome)
    }

    pub async fn reload(&self) -> AgencyResult<TestEngineResult> {
        expect_result(self.request(AgentRequest::Reload, None).await?)
    }

    pub async fn unload(&self) -> AgencyResult<()> {
        expect_done(self.request(AgentRequest::Unload, None).await?)
    }

    pub async fn explore(&self, filter: &TestFilter) -> AgencyResult<TestEngineResult> {
        let request = AgentRequest::Explore {
            filter: filter.clone(),
        };
        expect_result(self.request(request, None).await?)
    }

    pub async fn count_test_cases(&self, filter: &TestFilter) -> AgencyResult<usize> {
        let request = AgentRequest::CountTestCases {
            filter: filter.clone(),
        };
        match self.request(request, None).await? {
            ReplyOutcome::Count { count } => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
    ) -> AgencyResult<TestEngineResult> {
        let request = AgentRequest::Run {
            filter: filter.clone(),
        };
        expect_result(self.request(request, Some(listener)).await?)
    }

    pub async fn stop_run(&self, force: bool) -> AgencyResult<()> {
        expect_done(self.request(AgentRequest::StopRun { force }, None).await?)
    }

    /// Asks the agent process to exit.
    pub async fn stop(&self) -> AgencyResult<()> {
        expect_done(self.request(AgentRequest::Stop, None).await?)
    }
}

fn unexpected(outcome: &ReplyOutcome) -> AgencyError {
    AgencyError::UnexpectedReply(format!("{:?}", outcome))
}

fn expect_result(outcome: ReplyOutcome) -> AgencyResult<TestEngineResult> {
    match outcome {
        ReplyOutcome::Result { result } => Ok(result),
        other => Err(unexpected(&other)),
    }
}

fn expect_done(outcome: ReplyOutcome) -> AgencyResult<()> {
    match outcome {
        ReplyOutcome::Done => Ok(()),
        other => Err(unexpected(&other)),
    }
}
