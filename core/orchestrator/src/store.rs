//! Persistence abstraction. The engine depends only on the `Store` trait;
//! `SqliteStore` is the one production backend, `InMemoryStore` backs unit
//! tests so they don't need a filesystem or a connection pool.

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use shared_types::{
    ApprovalQueueEntry, AuditRecord, ConversationMessage, EscalationEvent, QueueEntryId, RetryRecord, Workflow,
    WorkflowId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError>;

    async fn insert_approval_entry(&self, entry: &ApprovalQueueEntry) -> Result<(), StoreError>;
    async fn update_approval_entry(&self, entry: &ApprovalQueueEntry) -> Result<(), StoreError>;
    async fn get_approval_entry(&self, id: QueueEntryId) -> Result<ApprovalQueueEntry, StoreError>;
    async fn list_pending_approval_entries(&self) -> Result<Vec<ApprovalQueueEntry>, StoreError>;

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError>;

    async fn insert_escalation(&self, event: &EscalationEvent) -> Result<(), StoreError>;

    async fn append_conversation_message(&self, message: &ConversationMessage) -> Result<(), StoreError>;
    async fn get_conversation_history(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, StoreError>;

    async fn insert_retry_record(&self, record: &RetryRecord) -> Result<(), StoreError>;
}

/// Simple mutex-guarded in-memory store used by unit tests across the crate.
pub struct InMemoryStore {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
    approval_entries: Mutex<HashMap<QueueEntryId, ApprovalQueueEntry>>,
    audit_records: Mutex<Vec<AuditRecord>>,
    escalations: Mutex<Vec<EscalationEvent>>,
    conversation_history: Mutex<HashMap<String, Vec<ConversationMessage>>>,
    retry_records: Mutex<Vec<RetryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
            approval_entries: Mutex::new(HashMap::new()),
            audit_records: Mutex::new(Vec::new()),
            escalations: Mutex::new(Vec::new()),
            conversation_history: Mutex::new(HashMap::new()),
            retry_records: Mutex::new(Vec::new()),
        }
    }

    pub async fn escalation_count(&self) -> usize {
        self.escalations.lock().await.len()
    }

    pub async fn audit_record_count(&self) -> usize {
        self.audit_records.lock().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows.lock().await.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut guard = self.workflows.lock().await;
        if !guard.contains_key(&workflow.id) {
            return Err(StoreError::NotFound);
        }
        guard.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        self.workflows.lock().await.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn insert_approval_entry(&self, entry: &ApprovalQueueEntry) -> Result<(), StoreError> {
        self.approval_entries.lock().await.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn update_approval_entry(&self, entry: &ApprovalQueueEntry) -> Result<(), StoreError> {
        let mut guard = self.approval_entries.lock().await;
        if !guard.contains_key(&entry.id) {
            return Err(StoreError::NotFound);
        }
        guard.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_approval_entry(&self, id: QueueEntryId) -> Result<ApprovalQueueEntry, StoreError> {
        self.approval_entries.lock().await.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_pending_approval_entries(&self) -> Result<Vec<ApprovalQueueEntry>, StoreError> {
        Ok(self
            .approval_entries
            .lock()
            .await
            .values()
            .filter(|e| e.status == shared_types::ApprovalStatus::Pending)
            .cloned()
            .collect())
    }

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.audit_records.lock().await.push(record.clone());
        Ok(())
    }

    async fn insert_escalation(&self, event: &EscalationEvent) -> Result<(), StoreError> {
        self.escalations.lock().await.push(event.clone());
        Ok(())
    }

    async fn append_conversation_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        self.conversation_history
            .lock()
            .await
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn get_conversation_history(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
        Ok(self.conversation_history.lock().await.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn insert_retry_record(&self, record: &RetryRecord) -> Result<(), StoreError> {
        self.retry_records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Rusqlite-backed store, pooled via r2d2. Rows are stored as JSON blobs
/// keyed by id: the domain types already derive `Serialize`/`Deserialize`,
/// and a collections workflow's query patterns are all point lookups or
/// small filtered scans, so a normalized relational schema buys nothing a
/// key/value-over-SQL table doesn't already give us.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Result<Self, StoreError> {
        let conn = pool.get().map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workflows (id TEXT PRIMARY KEY, data TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS approval_entries (id TEXT PRIMARY KEY, status TEXT NOT NULL, data TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS audit_records (id TEXT PRIMARY KEY, data TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS escalations (id TEXT PRIMARY KEY, data TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS conversation_history (conversation_id TEXT NOT NULL, seq INTEGER NOT NULL, data TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS retry_records (id TEXT PRIMARY KEY, data TEXT NOT NULL);",
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool.get().map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let data = serde_json::to_string(workflow).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO workflows (id, data) VALUES (?1, ?2)",
            rusqlite::params![workflow.id.to_string(), data],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.insert_workflow(workflow).await
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        let conn = self.conn()?;
        let data: String = conn
            .query_row(
                "SELECT data FROM workflows WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|_| StoreError::NotFound)?;
        serde_json::from_str(&data).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn insert_approval_entry(&self, entry: &ApprovalQueueEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let data = serde_json::to_string(entry).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO approval_entries (id, status, data) VALUES (?1, ?2, ?3)",
            rusqlite::params![entry.id.to_string(), format!("{:?}", entry.status), data],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_approval_entry(&self, entry: &ApprovalQueueEntry) -> Result<(), StoreError> {
        self.insert_approval_entry(entry).await
    }

    async fn get_approval_entry(&self, id: QueueEntryId) -> Result<ApprovalQueueEntry, StoreError> {
        let conn = self.conn()?;
        let data: String = conn
            .query_row(
                "SELECT data FROM approval_entries WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|_| StoreError::NotFound)?;
        serde_json::from_str(&data).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn list_pending_approval_entries(&self) -> Result<Vec<ApprovalQueueEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT data FROM approval_entries WHERE status = ?1")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params!["Pending"], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            let data = row.map_err(|e| StoreError::Backend(e.to_string()))?;
            entries.push(serde_json::from_str(&data).map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(entries)
    }

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let data = serde_json::to_string(record).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO audit_records (id, data) VALUES (?1, ?2)",
            rusqlite::params![record.id.to_string(), data],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn insert_escalation(&self, event: &EscalationEvent) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let data = serde_json::to_string(event).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO escalations (id, data) VALUES (?1, ?2)",
            rusqlite::params![event.id.to_string(), data],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn append_conversation_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let data = serde_json::to_string(message).map_err(|e| StoreError::Backend(e.to_string()))?;
        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM conversation_history WHERE conversation_id = ?1",
                rusqlite::params![message.conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT INTO conversation_history (conversation_id, seq, data) VALUES (?1, ?2, ?3)",
            rusqlite::params![message.conversation_id, seq, data],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_conversation_history(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT data FROM conversation_history WHERE conversation_id = ?1 ORDER BY seq ASC")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![conversation_id], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut messages = Vec::new();
        for row in rows {
            let data = row.map_err(|e| StoreError::Backend(e.to_string()))?;
            messages.push(serde_json::from_str(&data).map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(messages)
    }

    async fn insert_retry_record(&self, record: &RetryRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let data = serde_json::to_string(record).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO retry_records (id, data) VALUES (?1, ?2)",
            rusqlite::params![record.id.to_string(), data],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// Convenience constructor for an in-memory (`:memory:`) SQLite pool, used
/// in integration-style tests that want to exercise the real SQL path.
pub fn build_sqlite_pool(path: &str) -> Result<Pool<SqliteConnectionManager>, StoreError> {
    let manager = SqliteConnectionManager::file(path);
    Pool::new(manager).map_err(|e| StoreError::Backend(e.to_string()))
}
