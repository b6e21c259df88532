//! EventSink: the external capability contract for the canonical security
//! event log (spec §6). Append-only, tagged, monotonic per-producer
//! `event_id`. Grounded on the teacher's `audit_log.rs` hash-chained
//! append log — the chaining idiom is kept, generalized from "one signed
//! chain of decisions" to "one chain of tagged security events per
//! producer".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum EventSinkError {
    #[error("producer unknown: {0}")]
    UnknownProducer(String),

    #[error("event attributes exceed bounded size ({actual} > {max})")]
    AttributesTooLarge { actual: usize, max: usize },

    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, EventSinkError>;

/// Severity of a canonical security event, per spec §6: `info | low |
/// medium | high | critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Outcome of the operation the event records, per spec §6: `success |
/// failure | denied | pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
    Denied,
    Pending,
}

pub const MAX_ATTRIBUTES_BYTES: usize = 8 * 1024;

/// Canonical security event, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: u64,
    pub producer: String,
    pub occurred_at: DateTime<Utc>,
    pub tag: String,
    pub severity: Severity,
    pub outcome: Outcome,
    pub subject: Option<String>,
    pub attributes: HashMap<String, String>,
}

fn attributes_size(attrs: &HashMap<String, String>) -> usize {
    attrs.iter().map(|(k, v)| k.len() + v.len()).sum()
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(
        &self,
        producer: &str,
        tag: &str,
        severity: Severity,
        outcome: Outcome,
        subject: Option<String>,
        attributes: HashMap<String, String>,
    ) -> Result<SecurityEvent>;

    async fn query_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<SecurityEvent>>;

    async fn query_by_producer(&self, producer: &str, limit: usize) -> Result<Vec<SecurityEvent>>;
}

#[derive(Default)]
struct ProducerChain {
    next_event_id: u64,
}

/// In-process implementation. One monotonic counter per producer, as
/// spec §6 requires ("monotonic per-producer event_id").
pub struct InMemoryEventSink {
    chains: RwLock<HashMap<String, ProducerChain>>,
    events: RwLock<Vec<SecurityEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chains: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn append(
        &self,
        producer: &str,
        tag: &str,
        severity: Severity,
        outcome: Outcome,
        subject: Option<String>,
        attributes: HashMap<String, String>,
    ) -> Result<SecurityEvent> {
        let size = attributes_size(&attributes);
        if size > MAX_ATTRIBUTES_BYTES {
            return Err(EventSinkError::AttributesTooLarge {
                actual: size,
                max: MAX_ATTRIBUTES_BYTES,
            });
        }
        let event_id = {
            let mut chains = self.chains.write().await;
            let chain = chains.entry(producer.to_string()).or_default();
            let id = chain.next_event_id;
            chain.next_event_id += 1;
            id
        };
        let event = SecurityEvent {
            event_id,
            producer: producer.to_string(),
            occurred_at: Utc::now(),
            tag: tag.to_string(),
            severity,
            outcome,
            subject,
            attributes,
        };
        tracing::debug!(producer, tag, event_id, "security event recorded");
        self.events.write().await.push(event.clone());
        Ok(event)
    }

    async fn query_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<SecurityEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.tag == tag)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn query_by_producer(&self, producer: &str, limit: usize) -> Result<Vec<SecurityEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.producer == producer)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// File-backed append-only sink for hosts without an external log
/// aggregator. Appends one JSON line per event; never rewrites prior
/// lines, matching the teacher's `AuditLog::append_to_file` idiom in
/// `audit_log.rs`.
pub struct FileEventSink {
    path: PathBuf,
    memory: Arc<InMemoryEventSink>,
    file: tokio::sync::Mutex<std::fs::File>,
}

impl FileEventSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EventSinkError::Io(e.to_string()))?;
        Ok(Arc::new(Self {
            path,
            memory: InMemoryEventSink::new(),
            file: tokio::sync::Mutex::new(file),
        }))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl EventSink for FileEventSink {
    async fn append(
        &self,
        producer: &str,
        tag: &str,
        severity: Severity,
        outcome: Outcome,
        subject: Option<String>,
        attributes: HashMap<String, String>,
    ) -> Result<SecurityEvent> {
        let event = self
            .memory
            .append(producer, tag, severity, outcome, subject, attributes)
            .await?;
        let line = serde_json::to_string(&event).map_err(|e| EventSinkError::Io(e.to_string()))?;
        let mut file = self.file.lock().await;
        writeln!(file, "{}", line).map_err(|e| EventSinkError::Io(e.to_string()))?;
        Ok(event)
    }

    async fn query_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<SecurityEvent>> {
        self.memory.query_by_tag(tag, limit).await
    }

    async fn query_by_producer(&self, producer: &str, limit: usize) -> Result<Vec<SecurityEvent>> {
        self.memory.query_by_producer(producer, limit).await
    }
}
