//! Collaborator interfaces for run history, counters and operator roles
//!
//! The orchestrator only talks to these traits. The adapters here are small
//! reference implementations: an in-memory store and an append-only
//! JSON-lines file store.

use crate::outcome::{RunOutcome, StoredRun};
use crate::{CellError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Running totals of sorted items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub sorted: u64,
    pub accepted: u64,
    pub rejected: u64,
}

impl Counter {
    fn bump(&mut self, accepted: bool) {
        self.sorted += 1;
        if accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
    }
}

/// Storage for finished runs and item counters
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist one finished run
    async fn record_run(&self, outcome: &RunOutcome) -> Result<()>;

    /// Current counter totals
    async fn counter(&self) -> Result<Counter>;

    /// Count one sorted item and return the new totals
    async fn increment_counter(&self, accepted: bool) -> Result<Counter>;

    /// Most recent rows first
    async fn latest_runs(&self, limit: usize) -> Result<Vec<StoredRun>>;
}

/// Answers whether an operator may see administrative views
pub trait OperatorDirectory: Send + Sync {
    fn is_admin(&self, username: &str) -> bool;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<Vec<StoredRun>>,
    counter: Mutex<Counter>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn record_run(&self, outcome: &RunOutcome) -> Result<()> {
        self.runs.lock().await.push(outcome.to_stored());
        Ok(())
    }

    async fn counter(&self) -> Result<Counter> {
        Ok(*self.counter.lock().await)
    }

    async fn increment_counter(&self, accepted: bool) -> Result<Counter> {
        let mut counter = self.counter.lock().await;
        counter.bump(accepted);
        Ok(*counter)
    }

    async fn latest_runs(&self, limit: usize) -> Result<Vec<StoredRun>> {
        Ok(newest_first(self.runs.lock().await.clone(), limit))
    }
}

/// Append-only JSON-lines run log with a JSON counter file
#[derive(Debug)]
pub struct JsonlStore {
    runs_path: PathBuf,
    counter_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(runs_path: PathBuf, counter_path: PathBuf) -> Self {
        Self {
            runs_path,
            counter_path,
            write_lock: Mutex::new(()),
        }
    }

    async fn read_counter(&self) -> Result<Counter> {
        match tokio::fs::read_to_string(&self.counter_path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Counter::default()),
            Err(e) => Err(CellError::Persistence(format!(
                "Failed to read {}: {}",
                self.counter_path.display(),
                e
            ))),
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CellError::Persistence(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}

#[async_trait]
impl RunStore for JsonlStore {
    async fn record_run(&self, outcome: &RunOutcome) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_string(&outcome.to_stored())?;
        line.push('\n');

        ensure_parent(&self.runs_path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.runs_path)
            .await
            .map_err(|e| {
                CellError::Persistence(format!("Failed to open {}: {}", self.runs_path.display(), e))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn counter(&self) -> Result<Counter> {
        // a rewrite truncates the file first
        let _guard = self.write_lock.lock().await;
        self.read_counter().await
    }

    async fn increment_counter(&self, accepted: bool) -> Result<Counter> {
        let _guard = self.write_lock.lock().await;
        let mut counter = self.read_counter().await?;
        counter.bump(accepted);
        ensure_parent(&self.counter_path).await?;
        tokio::fs::write(&self.counter_path, serde_json::to_string(&counter)?).await?;
        Ok(counter)
    }

    async fn latest_runs(&self, limit: usize) -> Result<Vec<StoredRun>> {
        let contents = match tokio::fs::read_to_string(&self.runs_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let rows = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<StoredRun>(line) {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!("Skipping unreadable run row: {}", e);
                    None
                }
            })
            .collect();
        Ok(newest_first(rows, limit))
    }
}

fn newest_first(mut rows: Vec<StoredRun>, limit: usize) -> Vec<StoredRun> {
    rows.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
    rows.truncate(limit);
    rows
}

/// Fixed set of administrator names
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    admins: HashSet<String>,
}

impl StaticDirectory {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl OperatorDirectory for StaticDirectory {
    fn is_admin(&self, username: &str) -> bool {
        self.admins.contains(username)
    }
}
