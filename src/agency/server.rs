//! TCP endpoint agents call back to.
//!
//! Every launched agent opens one connection, registers, and then keeps
//! the connection for the rest of its life. The connection task feeds
//! status reports into the [`AgentDataBase`] and routes replies and events
//! to the agent's [`RemoteAgent`] proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{AgencyMessage, AgentMessage, MessageReader, MessageWriter};
use super::{AgencyError, AgencyResult, AgentDataBase, RemoteAgent};

/// Listening side of the agency.
pub struct AgencyServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl AgencyServer {
    /// Binds `addr` and starts accepting agent connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str, database: Arc<AgentDataBase>) -> AgencyResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!("Agency listening on {}", local_addr);
        let task = tokio::spawn(accept_loop(listener, database, shutdown.clone()));

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Callback address handed to agents.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// Stops accepting connections and closes the open ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AgencyServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, database: Arc<AgentDataBase>, shutdown: CancellationToken) {
    loop {
        let accepted = select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Agent connection from {}", peer);
                let database = database.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, database, shutdown).await {
                        warn!("Agent connection from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept agent connection: {}", e),
        }
    }
    debug!("Agency listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    database: Arc<AgentDataBase>,
    shutdown: CancellationToken,
) -> AgencyResult<()> {
    let (read, write) = stream.into_split();
    let mut reader = MessageReader::new(BufReader::new(read));
    let mut writer = MessageWriter::new(write);

    let agent_id = match reader.expect::<AgentMessage>().await? {
        AgentMessage::Register { agent_id } => agent_id,
        other => {
            let reason = format!("expected register, got {:?}", other);
            writer.send(&AgencyMessage::Rejected { reason: reason.clone() }).await?;
            return Err(AgencyError::UnexpectedReply(reason));
        }
    };

    if database.status(agent_id).is_none() {
        warn!("Rejecting registration of unknown agent {}", agent_id);
        writer
            .send(&AgencyMessage::Rejected {
                reason: format!("unknown agent {}", agent_id),
            })
            .await?;
        return Ok(());
    }

    writer.send(&AgencyMessage::Registered).await?;
    let agent = Arc::new(RemoteAgent::new(agent_id, Box::new(writer.into_inner())));
    database.register(agent.clone())?;
    info!("Agent {} registered", agent_id);

    loop {
        let message = select! {
            _ = shutdown.cancelled() => break,
            message = reader.recv::<AgentMessage>() => message,
        };

        match message {
            Ok(Some(AgentMessage::Status { agent_id, status })) => {
                debug!("Agent {} is {}", agent_id, status);
                if let Err(e) = database.report_status(agent_id, status) {
                    warn!("Ignoring status report: {}", e);
                }
            }
            Ok(Some(AgentMessage::Event { request, event })) => agent.dispatch_event(request, &event),
            Ok(Some(AgentMessage::Reply { request, outcome })) => agent.complete(request, outcome),
            Ok(Some(AgentMessage::Register { .. })) => {
                warn!("Agent {} registered twice, ignoring", agent_id);
            }
            Ok(None) => {
                debug!("Agent {} disconnected", agent_id);
                break;
            }
            Err(e) => {
                warn!("Agent {} sent a bad message: {}", agent_id, e);
                break;
            }
        }
    }

    agent.close();
    Ok(())
}
