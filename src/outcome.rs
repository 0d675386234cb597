//! Run requests, run outcomes and the persisted run-metadata format
//!
//! Finished runs are stored as a row of `(ended_at, items_counted, meta)`.
//! Batch rows carry the target cycle count in `items_counted` and a
//! pipe-separated metadata string:
//!
//! ```text
//! alice | batchCycles=5 | securityStartUtc=2026-01-02T10:00:00Z | securityEndUtc=2026-01-02T10:01:00Z
//! ```
//!
//! Emergency rows use `items_counted = -1` and
//! `EMERGENCY| user=alice | pressedUtc=2026-01-02T10:00:00Z`.

use crate::{CellError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel item count marking an emergency-stop row
pub const EMERGENCY_ITEMS: i32 = -1;

const EMERGENCY_PREFIX: &str = "EMERGENCY|";
const UNKNOWN_OPERATOR: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Manual,
    Batch,
}

/// Validated request to start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    pub mode: RunMode,
    /// Cycle limit handed to the program; 0 means unbounded
    pub target: u32,
}

impl RunRequest {
    pub fn manual() -> Self {
        Self {
            mode: RunMode::Manual,
            target: crate::program::UNBOUNDED_CYCLES,
        }
    }

    pub fn batch(cycles: i64) -> Result<Self> {
        if cycles < 1 {
            return Err(CellError::Validation(format!(
                "Batch size must be at least 1 (got {})",
                cycles
            )));
        }
        let target = u32::try_from(cycles).map_err(|_| {
            CellError::Validation(format!("Batch size {} is too large", cycles))
        })?;
        Ok(Self {
            mode: RunMode::Batch,
            target,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeKind {
    Batch {
        target_cycles: u32,
        dwell_started: DateTime<Utc>,
        dwell_ended: DateTime<Utc>,
        /// The monitor lost the link instead of seeing the program finish
        link_lost: bool,
    },
    Emergency {
        pressed_at: DateTime<Utc>,
    },
}

/// A finished run, handed to the run store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub completed_at: DateTime<Utc>,
    pub operator: String,
    #[serde(flatten)]
    pub kind: OutcomeKind,
}

impl RunOutcome {
    pub fn batch(
        operator: &str,
        target_cycles: u32,
        dwell_started: DateTime<Utc>,
        dwell_ended: DateTime<Utc>,
        link_lost: bool,
    ) -> Self {
        Self {
            completed_at: dwell_ended,
            operator: operator.to_string(),
            kind: OutcomeKind::Batch {
                target_cycles,
                dwell_started,
                dwell_ended,
                link_lost,
            },
        }
    }

    pub fn emergency(operator: &str, pressed_at: DateTime<Utc>) -> Self {
        Self {
            completed_at: pressed_at,
            operator: operator.to_string(),
            kind: OutcomeKind::Emergency { pressed_at },
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self.kind, OutcomeKind::Emergency { .. })
    }

    pub fn items_counted(&self) -> i32 {
        match self.kind {
            OutcomeKind::Batch { target_cycles, .. } => {
                i32::try_from(target_cycles).unwrap_or(i32::MAX)
            }
            OutcomeKind::Emergency { .. } => EMERGENCY_ITEMS,
        }
    }

    /// Encode the metadata string stored alongside the row.
    ///
    /// The operator name is not preserved exactly: it is trimmed, every `|`
    /// becomes `/`, and a blank name is written as `unknown`. Parsing the
    /// string back yields the cleaned name.
    pub fn encode_meta(&self) -> String {
        let who = sanitize(&self.operator);
        match &self.kind {
            OutcomeKind::Batch {
                target_cycles,
                dwell_started,
                dwell_ended,
                link_lost,
            } => {
                let mut meta = format!(
                    "{} | batchCycles={} | securityStartUtc={} | securityEndUtc={}",
                    who,
                    target_cycles,
                    format_utc(dwell_started),
                    format_utc(dwell_ended)
                );
                if *link_lost {
                    meta.push_str(" | completion=linkLost");
                }
                meta
            }
            OutcomeKind::Emergency { pressed_at } => {
                format!("{} user={} | pressedUtc={}", EMERGENCY_PREFIX, who, format_utc(pressed_at))
            }
        }
    }

    pub fn to_stored(&self) -> StoredRun {
        StoredRun {
            ended_at: self.completed_at,
            items_counted: self.items_counted(),
            meta: self.encode_meta(),
        }
    }
}

/// Persisted row shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRun {
    pub ended_at: DateTime<Utc>,
    pub items_counted: i32,
    pub meta: String,
}

impl StoredRun {
    /// Rebuild the outcome from its metadata; `None` for rows in an unknown format
    pub fn to_outcome(&self) -> Option<RunOutcome> {
        if self.items_counted == EMERGENCY_ITEMS {
            let (operator, pressed_at) = parse_emergency_meta(&self.meta)?;
            return Some(RunOutcome {
                completed_at: self.ended_at,
                operator,
                kind: OutcomeKind::Emergency { pressed_at },
            });
        }
        let meta = parse_batch_meta(&self.meta)?;
        Some(RunOutcome {
            completed_at: self.ended_at,
            operator: meta.operator,
            kind: OutcomeKind::Batch {
                target_cycles: meta.target_cycles,
                dwell_started: meta.dwell_started,
                dwell_ended: meta.dwell_ended,
                link_lost: meta.link_lost,
            },
        })
    }
}

/// Fields of a batch metadata string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMeta {
    pub operator: String,
    pub target_cycles: u32,
    pub dwell_started: DateTime<Utc>,
    pub dwell_ended: DateTime<Utc>,
    pub link_lost: bool,
}

pub fn parse_batch_meta(meta: &str) -> Option<BatchMeta> {
    let parts = split_meta(meta);
    if parts.len() < 4 || meta.starts_with(EMERGENCY_PREFIX) {
        return None;
    }

    let operator = parts[0].to_string();
    let mut target_cycles = None;
    let mut dwell_started = None;
    let mut dwell_ended = None;
    let mut link_lost = false;

    for part in &parts[1..] {
        if let Some(value) = strip_key(part, "batchCycles=") {
            target_cycles = value.parse::<u32>().ok();
        } else if let Some(value) = strip_key(part, "securityStartUtc=") {
            dwell_started = parse_utc(value);
        } else if let Some(value) = strip_key(part, "securityEndUtc=") {
            dwell_ended = parse_utc(value);
        } else if let Some(value) = strip_key(part, "completion=") {
            link_lost = value.eq_ignore_ascii_case("linkLost");
        }
    }

    Some(BatchMeta {
        operator,
        target_cycles: target_cycles?,
        dwell_started: dwell_started?,
        dwell_ended: dwell_ended?,
        link_lost,
    })
}

pub fn parse_emergency_meta(meta: &str) -> Option<(String, DateTime<Utc>)> {
    if !meta.starts_with(EMERGENCY_PREFIX) {
        return None;
    }
    let parts = split_meta(meta);
    let operator = parts
        .iter()
        .find_map(|p| strip_key(p, "user="))
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_OPERATOR.to_string());
    let pressed_at = parts
        .iter()
        .find_map(|p| strip_key(p, "pressedUtc="))
        .and_then(parse_utc)?;
    Some((operator, pressed_at))
}

fn split_meta(meta: &str) -> Vec<&str> {
    meta.split('|').map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn strip_key<'a>(part: &'a str, key: &str) -> Option<&'a str> {
    match part.get(..key.len()) {
        Some(head) if head.eq_ignore_ascii_case(key) => Some(part[key.len()..].trim()),
        _ => None,
    }
}

fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Operator names end up inside a pipe-separated string
fn sanitize(operator: &str) -> String {
    let cleaned = operator.replace('|', "/").trim().to_string();
    if cleaned.is_empty() {
        UNKNOWN_OPERATOR.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_batch_request_validation() {
        assert!(matches!(RunRequest::batch(0), Err(CellError::Validation(_))));
        assert!(matches!(RunRequest::batch(-4), Err(CellError::Validation(_))));
        let request = RunRequest::batch(12).unwrap();
        assert_eq!(request.mode, RunMode::Batch);
        assert_eq!(request.target, 12);
        assert_eq!(RunRequest::manual().target, 0);
    }

    #[test]
    fn test_batch_meta_round_trip() {
        let start = at(9, 0, 0) + Duration::nanoseconds(123_456_789);
        let end = start + Duration::seconds(60);
        let outcome = RunOutcome::batch("alice", 3, start, end, false);

        let stored = outcome.to_stored();
        assert_eq!(stored.items_counted, 3);
        assert!(stored.meta.starts_with("alice | batchCycles=3 | securityStartUtc="));

        assert_eq!(stored.to_outcome(), Some(outcome));
    }

    #[test]
    fn test_link_lost_marker_survives() {
        let outcome = RunOutcome::batch("bob", 8, at(1, 0, 0), at(1, 1, 0), true);
        let meta = outcome.encode_meta();
        assert!(meta.ends_with("| completion=linkLost"));
        assert!(parse_batch_meta(&meta).unwrap().link_lost);
    }

    #[test]
    fn test_emergency_meta() {
        let outcome = RunOutcome::emergency("carol", at(12, 30, 5));
        let stored = outcome.to_stored();
        assert_eq!(stored.items_counted, EMERGENCY_ITEMS);
        assert_eq!(stored.meta, "EMERGENCY| user=carol | pressedUtc=2026-03-14T12:30:05Z");
        assert!(parse_batch_meta(&stored.meta).is_none());
        assert_eq!(stored.to_outcome(), Some(outcome));
    }

    #[test]
    fn test_parses_rows_written_with_offsets_and_mixed_case() {
        let meta = "dave | BATCHCYCLES=2 | securityStartUtc=2026-03-14T10:00:00.5+00:00 | securityendutc=2026-03-14T10:01:00.5+00:00";
        let parsed = parse_batch_meta(meta).unwrap();
        assert_eq!(parsed.operator, "dave");
        assert_eq!(parsed.target_cycles, 2);
        assert_eq!(parsed.dwell_ended - parsed.dwell_started, Duration::seconds(60));
    }

    #[test]
    fn test_incomplete_meta_is_rejected() {
        assert!(parse_batch_meta("").is_none());
        assert!(parse_batch_meta("eve | batchCycles=2 | securityStartUtc=2026-03-14T10:00:00Z").is_none());
        assert!(parse_batch_meta("eve | batchCycles=x | securityStartUtc=2026-03-14T10:00:00Z | securityEndUtc=2026-03-14T10:00:00Z").is_none());
    }

    #[test]
    fn test_operator_pipes_are_sanitized() {
        let outcome = RunOutcome::batch("a|b", 1, at(0, 0, 0), at(0, 1, 0), false);
        let parsed = parse_batch_meta(&outcome.encode_meta()).unwrap();
        assert_eq!(parsed.operator, "a/b");
    }

    #[test]
    fn test_operator_name_is_trimmed_or_defaulted() {
        let padded = RunOutcome::batch("  ana ", 1, at(0, 0, 0), at(0, 1, 0), false);
        assert_eq!(parse_batch_meta(&padded.encode_meta()).unwrap().operator, "ana");

        let blank = RunOutcome::emergency("   ", at(0, 2, 0));
        assert!(blank.encode_meta().contains("user=unknown"));
        assert_eq!(blank.operator, "   ");
    }
}
