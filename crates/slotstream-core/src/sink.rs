use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::record::ChangeRecord;

/// How far a sink has taken a delivered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// The record was accepted but may be lost if the process dies.
    Received,
    /// The record has been durably processed.
    Persisted,
}

/// Destination for change records.
pub trait ChangeSink: Send {
    /// Deliver one record. Records arrive in stream order.
    fn deliver(&mut self, record: ChangeRecord) -> impl Future<Output = Result<Durability>> + Send;
}

/// An in-memory sink for testing.
#[derive(Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

struct MemoryState {
    records: Vec<ChangeRecord>,
    durability: Durability,
    fail_with: Option<String>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_durability(Durability::Persisted)
    }

    /// Create a sink that reports every record with the given durability.
    pub fn with_durability(durability: Durability) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                records: Vec::new(),
                durability,
                fail_with: None,
            })),
        }
    }

    /// Create a sink that rejects every record.
    pub fn failing(error_message: impl Into<String>) -> Self {
        let sink = Self::new();
        sink.lock().fail_with = Some(error_message.into());
        sink
    }

    /// Change the durability reported for subsequent records.
    pub fn set_durability(&self, durability: Durability) {
        self.lock().durability = durability;
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChangeSink for MemorySink {
    fn deliver(&mut self, record: ChangeRecord) -> impl Future<Output = Result<Durability>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            if let Some(ref error) = state.fail_with {
                return Err(Error::Sink(error.clone()));
            }

            state.records.push(record);
            Ok(state.durability)
        }
    }
}
