//! Wire protocol between the agency and its agents.
//!
//! Messages are JSON objects, one per line, over a TCP connection the agent
//! opens to the agency's callback address.
//!
//! ```text
//! agent                                   agency
//!   │── {"type":"register","agent_id":..} ──►│
//!   │◄── {"type":"registered"} ──────────────│   or "rejected"
//!   │── {"type":"status","status":"ready"} ─►│
//!   │◄── {"type":"request","id":1,"op":"load",...}
//!   │── {"type":"reply","request":1,"outcome":"result",...}
//!   │◄── {"type":"request","id":2,"op":"run",...}
//!   │── {"type":"event","request":2,"event":{...}}   (zero or more)
//!   │── {"type":"reply","request":2,...} ───►│
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::AgentStatus;
use crate::package::TestPackage;
use crate::result::{TestEngineResult, TestEvent, TestFilter};

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors reading or writing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,
}

/// Messages sent by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Register { agent_id: Uuid },
    Status { agent_id: Uuid, status: AgentStatus },
    Event { request: u64, event: TestEvent },
    Reply {
        request: u64,
        #[serde(flatten)]
        outcome: ReplyOutcome,
    },
}

/// Messages sent by the agency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgencyMessage {
    Registered,
    Rejected {
        reason: String,
    },
    Request {
        id: u64,
        #[serde(flatten)]
        request: AgentRequest,
    },
}

/// Operations an agent performs on behalf of the agency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    Load { package: TestPackage },
    Reload,
    Unload,
    Explore { filter: TestFilter },
    CountTestCases { filter: TestFilter },
    Run { filter: TestFilter },
    StopRun { force: bool },
    Stop,
}

impl AgentRequest {
    pub fn name(&self) -> &'static str {
        match self {
            AgentRequest::Load { .. } => "Load",
            AgentRequest::Reload => "Reload",
            AgentRequest::Unload => "Unload",
            AgentRequest::Explore { .. } => "Explore",
            AgentRequest::CountTestCases { .. } => "CountTestCases",
            AgentRequest::Run { .. } => "Run",
            AgentRequest::StopRun { .. } => "StopRun",
            AgentRequest::Stop => "Stop",
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Result { result: TestEngineResult },
    Count { count: usize },
    Done,
    Error { message: String },
}

/// Writes newline-delimited messages.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> ProtocolResult<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads newline-delimited messages.
pub struct MessageReader<R> {
    inner: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
        }
    }

    /// Next message, or `None` at end of stream. Blank lines are skipped.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(text)?));
        }
    }

    /// Next message, treating end of stream as an error.
    pub async fn expect<T: DeserializeOwned>(&mut self) -> ProtocolResult<T> {
        self.recv().await?.ok_or(ProtocolError::Closed)
    }
}
