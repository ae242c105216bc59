//! Records of the agents the agency has launched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{AgencyError, AgencyResult, AgentStatus, RemoteAgent};

/// Handle on a launched agent process.
#[derive(Debug, Clone, Default)]
pub struct AgentProcess {
    pub pid: Option<u32>,
    /// Cancel to kill the process.
    pub kill: CancellationToken,
    /// Cancelled by the watcher once the process has exited.
    pub exited: CancellationToken,
}

impl AgentProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }
}

/// Everything the agency knows about one agent.
#[derive(Clone)]
pub struct AgentRecord {
    pub id: Uuid,
    pub process: AgentProcess,
    /// Set once the agent has called back.
    pub agent: Option<Arc<RemoteAgent>>,
    pub status: AgentStatus,
}

impl AgentRecord {
    pub fn new(id: Uuid, process: AgentProcess) -> Self {
        Self {
            id,
            process,
            agent: None,
            status: AgentStatus::Starting,
        }
    }
}

/// Thread-safe table of agent records.
///
/// Waiters for a registration subscribe with [`registered`](Self::registered)
/// before checking the table, so a registration landing between the check
/// and the wait is never missed.
#[derive(Default)]
pub struct AgentDataBase {
    records: Mutex<HashMap<Uuid, AgentRecord>>,
    registered: Notify,
}

impl AgentDataBase {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Uuid, AgentRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, record: AgentRecord) {
        self.records().insert(record.id, record);
    }

    /// Attaches the callback proxy of a launched agent.
    ///
    /// # Errors
    ///
    /// Returns [`AgencyError::UnknownAgent`] if no agent with that id was
    /// launched.
    pub fn register(&self, agent: Arc<RemoteAgent>) -> AgencyResult<()> {
        let id = agent.id();
        {
            let mut records = self.records();
            let record = records.get_mut(&id).ok_or(AgencyError::UnknownAgent(id))?;
            record.agent = Some(agent);
        }
        self.registered.notify_waiters();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`AgencyError::UnknownAgent`] for an id not in the table.
    pub fn report_status(&self, id: Uuid, status: AgentStatus) -> AgencyResult<()> {
        let mut records = self.records();
        let record = records.get_mut(&id).ok_or(AgencyError::UnknownAgent(id))?;
        record.status = status;
        Ok(())
    }

    pub fn agent(&self, id: Uuid) -> Option<Arc<RemoteAgent>> {
        self.records().get(&id).and_then(|r| r.agent.clone())
    }

    pub fn status(&self, id: Uuid) -> Option<AgentStatus> {
        self.records().get(&id).map(|r| r.status)
    }

    pub fn process(&self, id: Uuid) -> Option<AgentProcess> {
        self.records().get(&id).map(|r| r.process.clone())
    }

    pub fn attach_pid(&self, id: Uuid, pid: Option<u32>) {
        if let Some(record) = self.records().get_mut(&id) {
            record.process.pid = pid;
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<AgentRecord> {
        self.records().remove(&id)
    }

    /// Removes and returns every record.
    pub fn clear(&self) -> Vec<AgentRecord> {
        self.records().drain().map(|(_, record)| record).collect()
    }

    /// Copy of every record.
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        self.records().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Completes on the next registration.
    pub fn registered(&self) -> Notified<'_> {
        self.registered.notified()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_unknown_ids_are_errors() {
        let db = AgentDataBase::new();
        let id = Uuid::new_v4();

        assert!(matches!(
            db.report_status(id, AgentStatus::Ready),
            Err(AgencyError::UnknownAgent(unknown)) if unknown == id
        ));
        assert!(matches!(
            db.register(RemoteAgent::detached(id)),
            Err(AgencyError::UnknownAgent(_))
        ));
        assert!(db.is_empty());
    }

    #[test]
    fn test_record_lifecycle() {
        let db = AgentDataBase::new();
        let id = Uuid::new_v4();
        db.add(AgentRecord::new(id, AgentProcess::new()));
        assert_eq!(db.status(id), Some(AgentStatus::Starting));
        assert!(db.agent(id).is_none());

        db.attach_pid(id, Some(42));
        assert_eq!(db.process(id).and_then(|p| p.pid), Some(42));

        db.register(RemoteAgent::detached(id)).unwrap();
        db.report_status(id, AgentStatus::Ready).unwrap();
        assert_eq!(db.agent(id).map(|a| a.id()), Some(id));
        assert_eq!(db.status(id), Some(AgentStatus::Ready));

        assert!(db.remove(id).is_some());
        assert_eq!(db.len(), 0);
    }

    #[tokio::test]
    async fn test_registration_wakes_waiters() {
        let db = Arc::new(AgentDataBase::new());
        let id = Uuid::new_v4();
        db.add(AgentRecord::new(id, AgentProcess::new()));

        let waiter = {
            let db = db.clone();
            tokio::spawn(async move {
                loop {
                    let notified = db.registered();
                    if db.agent(id).is_some() {
                        return;
                    }
                    notified.await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        db.register(RemoteAgent::detached(id)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_clear_returns_records() {
        let db = AgentDataBase::new();
        db.add(AgentRecord::new(Uuid::new_v4(), AgentProcess::new()));
        db.add(AgentRecord::new(Uuid::new_v4(), AgentProcess::new()));

        assert_eq!(db.clear().len(), 2);
        assert!(db.is_empty());
    }
}
