//! The agent side of the agency protocol.
//!
//! A test agent is a separate process launched by the [`TestAgency`]. It
//! connects back to the agency, registers under the id it was launched
//! with, and then serves requests against an in-process engine until it is
//! told to stop or the connection drops.
//!
//! ```text
//! test-agent <id> tcp://127.0.0.1:PORT
//!   connect ── register ── await registered ── status ready
//!   loop:
//!     request load/explore/count/...  ─► answered inline
//!     request run                     ─► spawned; events streamed, status busy
//!     request stop_run                ─► forwarded to the running runner
//!     request stop                    ─► reply, leave the loop
//! ```
//!
//! [`TestAgency`]: crate::agency::TestAgency

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agency::AgentStatus;
use crate::agency::protocol::{
    AgencyMessage, AgentMessage, AgentRequest, MessageReader, MessageWriter, ProtocolError, ReplyOutcome,
};
use crate::config::Config;
use crate::engine::TestEngine;
use crate::result::{TestEvent, TestEventListener, TestFilter};
use crate::runner::{RunnerResult, TestEngineRunner, TestRunnerFactory};
use crate::service::ServiceError;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that end an agent process.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unable to connect to agency at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command-line options of an agent process.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub agent_id: Uuid,
    /// Callback address, `tcp://host:port`.
    pub agency_url: String,
    /// Wait for a line on stdin before connecting, so a debugger can attach.
    pub pause: bool,
    pub verbose: bool,
}

impl AgentOptions {
    /// The socket address part of the agency URL.
    pub fn agency_addr(&self) -> &str {
        self.agency_url
            .strip_prefix("tcp://")
            .unwrap_or(&self.agency_url)
    }
}

/// Queues messages for the connection's writer task.
#[derive(Clone)]
struct Outbox {
    agent_id: Uuid,
    tx: mpsc::UnboundedSender<AgentMessage>,
}

impl Outbox {
    fn send(&self, message: AgentMessage) {
        if self.tx.send(message).is_err() {
            debug!("Connection writer is gone, dropping message");
        }
    }

    fn status(&self, status: AgentStatus) {
        self.send(AgentMessage::Status {
            agent_id: self.agent_id,
            status,
        });
    }

    fn reply(&self, request: u64, outcome: ReplyOutcome) {
        self.send(AgentMessage::Reply { request, outcome });
    }
}

/// Streams test events of one run request back to the agency.
struct WireListener {
    request: u64,
    outbox: Outbox,
}

impl TestEventListener for WireListener {
    fn on_event(&self, event: &TestEvent) {
        self.outbox.send(AgentMessage::Event {
            request: self.request,
            event: event.clone(),
        });
    }
}

/// The loaded package of this agent.
struct Session {
    factory: Arc<dyn TestRunnerFactory>,
    runner: Mutex<Option<Arc<dyn TestEngineRunner>>>,
    outbox: Outbox,
}

fn into_outcome<T>(result: RunnerResult<T>, ok: impl FnOnce(T) -> ReplyOutcome) -> ReplyOutcome {
    match result {
        Ok(value) => ok(value),
        Err(e) => ReplyOutcome::Error { message: e.to_string() },
    }
}

impl Session {
    async fn loaded(&self, op: &str) -> Result<Arc<dyn TestEngineRunner>, ReplyOutcome> {
        self.runner.lock().await.clone().ok_or_else(|| ReplyOutcome::Error {
            message: format!("{} called before Load", op),
        })
    }

    async fn handle(&self, request: AgentRequest) -> ReplyOutcome {
        let request = match request {
            AgentRequest::Load { package } => return self.load(package).await,
            other => other,
        };

        let runner = match self.loaded(request.name()).await {
            Ok(runner) => runner,
            Err(outcome) => return outcome,
        };

        match request {
            AgentRequest::Reload => into_outcome(runner.reload().await, |result| ReplyOutcome::Result { result }),
            AgentRequest::Unload => {
                self.runner.lock().await.take();
                into_outcome(runner.unload().await, |_| ReplyOutcome::Done)
            }
            AgentRequest::Explore { filter } => {
                into_outcome(runner.explore(&filter).await, |result| ReplyOutcome::Result { result })
            }
            AgentRequest::CountTestCases { filter } => {
                into_outcome(runner.count_test_cases(&filter).await, |count| ReplyOutcome::Count { count })
            }
            AgentRequest::StopRun { force } => into_outcome(runner.stop_run(force).await, |_| ReplyOutcome::Done),
            other => ReplyOutcome::Error {
                message: format!("{} is not handled inline", other.name()),
            },
        }
    }

    async fn load(&self, package: crate::package::TestPackage) -> ReplyOutcome {
        if let Some(previous) = self.runner.lock().await.take() {
            if let Err(e) = previous.unload().await {
                warn!("Failed to unload previous package: {}", e);
            }
        }

        let mut package = package;
        let runner = match self.factory.make_test_runner(&mut package) {
            Ok(runner) => runner,
            Err(e) => {
                error!("Cannot build a runner for {}: {}", package.display_name(), e);
                return ReplyOutcome::Error { message: e.to_string() };
            }
        };

        info!("Loading {} ({})", package.display_name(), runner.kind());
        let outcome = into_outcome(runner.load().await, |result| ReplyOutcome::Result { result });
        *self.runner.lock().await = Some(runner);
        outcome
    }

    /// Runs on its own task so that `stop_run` can reach the runner.
    async fn run(self: Arc<Self>, request: u64, filter: TestFilter) {
        let runner = match self.loaded("Run").await {
            Ok(runner) => runner,
            Err(outcome) => {
                self.outbox.reply(request, outcome);
                return;
            }
        };

        self.outbox.status(AgentStatus::Busy);
        let listener = Arc::new(WireListener {
            request,
            outbox: self.outbox.clone(),
        });
        let outcome = into_outcome(runner.run(listener, &filter).await, |result| ReplyOutcome::Result { result });
        self.outbox.reply(request, outcome);
        self.outbox.status(AgentStatus::Ready);
    }

    async fn unload(&self) {
        if let Some(runner) = self.runner.lock().await.take() {
            if let Err(e) = runner.unload().await {
                warn!("Failed to unload on shutdown: {}", e);
            }
        }
    }
}

async fn write_loop(mut writer: MessageWriter<OwnedWriteHalf>, mut rx: mpsc::UnboundedReceiver<AgentMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.send(&message).await {
            warn!("Failed to send to agency: {}", e);
            break;
        }
    }
}

/// A test agent serving one agency connection.
pub struct RemoteTestAgent {
    options: AgentOptions,
    engine: TestEngine,
}

impl RemoteTestAgent {
    /// # Errors
    ///
    /// Fails if `config` describes an invalid runtime environment.
    pub fn new(options: AgentOptions, config: Config) -> AgentResult<Self> {
        Ok(Self {
            options,
            engine: TestEngine::for_agent(config)?,
        })
    }

    /// Connects, registers and serves requests until stopped.
    ///
    /// # Errors
    ///
    /// Fails if the agency cannot be reached or rejects the registration.
    /// Failures of individual requests are replied to, not returned.
    pub async fn run(&mut self) -> AgentResult<()> {
        if self.options.pause {
            info!("Agent {} paused, press Enter to continue", self.options.agent_id);
            let mut line = String::new();
            BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        }

        self.engine.initialize().await?;
        let result = self.serve().await;
        self.engine.shutdown().await;
        result
    }

    async fn serve(&self) -> AgentResult<()> {
        let agent_id = self.options.agent_id;
        let stream = TcpStream::connect(self.options.agency_addr())
            .await
            .map_err(|source| AgentError::Connect {
                url: self.options.agency_url.clone(),
                source,
            })?;
        let (read, write) = stream.into_split();
        let mut reader = MessageReader::new(BufReader::new(read));
        let mut writer = MessageWriter::new(write);

        writer.send(&AgentMessage::Register { agent_id }).await?;
        match reader.expect::<AgencyMessage>().await? {
            AgencyMessage::Registered => info!("Agent {} registered", agent_id),
            AgencyMessage::Rejected { reason } => return Err(AgentError::Rejected(reason)),
            other => return Err(AgentError::Rejected(format!("unexpected reply {:?}", other))),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, rx));
        let outbox = Outbox { agent_id, tx };
        outbox.status(AgentStatus::Ready);

        let session = Arc::new(Session {
            factory: self.engine.factory().clone(),
            runner: Mutex::new(None),
            outbox: outbox.clone(),
        });

        loop {
            let (id, request) = match reader.recv::<AgencyMessage>().await {
                Ok(Some(AgencyMessage::Request { id, request })) => (id, request),
                Ok(Some(other)) => {
                    warn!("Ignoring unexpected message {:?}", other);
                    continue;
                }
                Ok(None) => {
                    info!("Agency closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Bad message from agency: {}", e);
                    break;
                }
            };

            debug!("Request {} {}", id, request.name());
            match request {
                AgentRequest::Run { filter } => {
                    tokio::spawn(session.clone().run(id, filter));
                }
                AgentRequest::Stop => {
                    outbox.status(AgentStatus::Stopping);
                    session.unload().await;
                    outbox.reply(id, ReplyOutcome::Done);
                    break;
                }
                request => {
                    let outcome = session.handle(request).await;
                    outbox.reply(id, outcome);
                }
            }
        }

        session.unload().await;
        drop(session);
        drop(outbox);
        if tokio::time::timeout(Duration::from_secs(5), writer_task).await.is_err() {
            warn!("Timed out flushing messages to the agency");
        }
        info!("Agent {} exiting", agent_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::net::tcp::OwnedReadHalf;

    use super::*;
    use crate::package::TestPackage;

    type Reader = MessageReader<BufReader<OwnedReadHalf>>;
    type Writer = MessageWriter<OwnedWriteHalf>;

    fn agent(addr: &str, dir: &TempDir) -> RemoteTestAgent {
        let mut config = Config::default();
        config.domain.shadow_copy_path = Some(dir.path().join("cache").display().to_string());
        let options = AgentOptions {
            agent_id: Uuid::new_v4(),
            agency_url: format!("tcp://{}", addr),
            pause: false,
            verbose: false,
        };
        RemoteTestAgent::new(options, config).unwrap()
    }

    async fn accept(listener: &TcpListener) -> (Reader, Writer) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        (MessageReader::new(BufReader::new(read)), MessageWriter::new(write))
    }

    /// Next reply, skipping status reports and events.
    async fn next_reply(reader: &mut Reader) -> (u64, ReplyOutcome) {
        loop {
            if let AgentMessage::Reply { request, outcome } = reader.expect::<AgentMessage>().await.unwrap() {
                return (request, outcome);
            }
        }
    }

    #[test]
    fn test_agency_addr_strips_scheme() {
        let options = AgentOptions {
            agent_id: Uuid::nil(),
            agency_url: "tcp://127.0.0.1:4000".into(),
            pause: false,
            verbose: false,
        };
        assert_eq!(options.agency_addr(), "127.0.0.1:4000");
    }

    #[tokio::test]
    async fn test_rejected_registration_is_an_error() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut agent = agent(&listener.local_addr().unwrap().to_string(), &dir);

        let agency = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(&listener).await;
            assert!(matches!(
                reader.expect::<AgentMessage>().await.unwrap(),
                AgentMessage::Register { .. }
            ));
            writer
                .send(&AgencyMessage::Rejected { reason: "who are you".into() })
                .await
                .unwrap();
        });

        let err = agent.run().await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected(reason) if reason == "who are you"));
        agency.await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_requests_until_stopped() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut agent = agent(&listener.local_addr().unwrap().to_string(), &dir);
        let missing = dir.path().join("missing.tests");

        let agency = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(&listener).await;
            reader.expect::<AgentMessage>().await.unwrap();
            writer.send(&AgencyMessage::Registered).await.unwrap();
            let AgentMessage::Status { status, .. } = reader.expect::<AgentMessage>().await.unwrap() else {
                panic!("expected a status report");
            };
            assert_eq!(status, AgentStatus::Ready);

            let request = |id, request| AgencyMessage::Request { id, request };

            writer
                .send(&request(1, AgentRequest::CountTestCases { filter: TestFilter::empty() }))
                .await
                .unwrap();
            let (id, outcome) = next_reply(&mut reader).await;
            assert_eq!(id, 1);
            assert_eq!(
                outcome,
                ReplyOutcome::Error {
                    message: "CountTestCases called before Load".into()
                }
            );

            let package = TestPackage::new(&missing);
            writer.send(&request(2, AgentRequest::Load { package })).await.unwrap();
            let (_, outcome) = next_reply(&mut reader).await;
            let ReplyOutcome::Result { result } = outcome else {
                panic!("expected a load result");
            };
            assert_eq!(result.summary().errors, 1);

            writer
                .send(&request(3, AgentRequest::Run { filter: TestFilter::empty() }))
                .await
                .unwrap();
            let (id, outcome) = next_reply(&mut reader).await;
            assert_eq!(id, 3);
            assert!(matches!(outcome, ReplyOutcome::Result { .. }));

            writer.send(&request(4, AgentRequest::Stop)).await.unwrap();
            let (id, outcome) = next_reply(&mut reader).await;
            assert_eq!((id, outcome), (4, ReplyOutcome::Done));
            writer.into_inner().shutdown().await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(10), agent.run())
            .await
            .unwrap()
            .unwrap();
        agency.await.unwrap();
    }
}
