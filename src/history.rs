//! Administrative views over recorded runs

use crate::outcome::{parse_batch_meta, parse_emergency_meta, BatchMeta, StoredRun, EMERGENCY_ITEMS};
use crate::persistence::{OperatorDirectory, RunStore};
use crate::{CellError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Rows scanned when building a view
const SCAN_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub ended_at: DateTime<Utc>,
    pub meta: BatchMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyRecord {
    pub pressed_at: DateTime<Utc>,
    pub operator: String,
}

pub struct RunHistory {
    store: Arc<dyn RunStore>,
    directory: Arc<dyn OperatorDirectory>,
}

impl RunHistory {
    pub fn new(store: Arc<dyn RunStore>, directory: Arc<dyn OperatorDirectory>) -> Self {
        Self { store, directory }
    }

    fn authorize(&self, caller: &str) -> Result<()> {
        if self.directory.is_admin(caller) {
            Ok(())
        } else {
            Err(CellError::Forbidden(format!("{} is not an administrator", caller)))
        }
    }

    /// Finished batch runs, newest first
    pub async fn batch_runs(&self, caller: &str, limit: usize) -> Result<Vec<BatchRecord>> {
        self.authorize(caller)?;
        let rows = self.store.latest_runs(SCAN_LIMIT).await?;
        Ok(batch_records(&rows, limit))
    }

    /// Emergency stops, newest first
    pub async fn emergency_log(&self, caller: &str, limit: usize) -> Result<Vec<EmergencyRecord>> {
        self.authorize(caller)?;
        let rows = self.store.latest_runs(SCAN_LIMIT).await?;
        Ok(emergency_records(&rows, limit))
    }
}

fn batch_records(rows: &[StoredRun], limit: usize) -> Vec<BatchRecord> {
    rows.iter()
        .filter(|row| row.items_counted != EMERGENCY_ITEMS)
        .filter_map(|row| {
            parse_batch_meta(&row.meta).map(|meta| BatchRecord {
                ended_at: row.ended_at,
                meta,
            })
        })
        .take(limit)
        .collect()
}

fn emergency_records(rows: &[StoredRun], limit: usize) -> Vec<EmergencyRecord> {
    rows.iter()
        .filter(|row| row.items_counted == EMERGENCY_ITEMS)
        .filter_map(|row| {
            parse_emergency_meta(&row.meta).map(|(operator, _)| EmergencyRecord {
                pressed_at: row.ended_at,
                operator,
            })
        })
        .take(limit)
        .collect()
}
