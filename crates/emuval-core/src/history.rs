//! Sealed-run history: locating runs and per-capability time series.

use std::collections::{BTreeMap, BTreeSet};

use emuval_state::{load_snapshot, RunId, RunSnapshot, RunStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compare::{capability_counts, classify_trend, pass_rate, TrendDirection};
use crate::error::{EngineError, EngineResult};

/// Load the newest `limit` sealed runs, newest first.
pub async fn recent_sealed_runs(store: &dyn RunStore, limit: usize) -> EngineResult<Vec<RunSnapshot>> {
    let mut runs = store.list_runs().await?;
    runs.retain(|r| r.status.is_sealed());
    let mut snapshots = Vec::new();
    for record in runs.into_iter().rev().take(limit) {
        snapshots.push(load_snapshot(store, &record.run_id).await?);
    }
    debug!(loaded = snapshots.len(), limit, "sealed runs loaded");
    Ok(snapshots)
}

/// Resolve the (current, previous) pair to compare.
///
/// With neither given, the two newest sealed runs. With only `previous`,
/// the newest sealed run is current.
pub async fn resolve_comparison_pair(
    store: &dyn RunStore,
    current: Option<RunId>,
    previous: Option<RunId>,
) -> EngineResult<(RunId, RunId)> {
    if let (Some(c), Some(p)) = (&current, &previous) {
        return Ok((c.clone(), p.clone()));
    }
    let sealed: Vec<RunId> = store
        .list_runs()
        .await?
        .into_iter()
        .filter(|r| r.status.is_sealed())
        .map(|r| r.run_id)
        .rev()
        .collect();

    match (current, previous) {
        (Some(c), None) => {
            let p = sealed
                .iter()
                .find(|id| **id < c)
                .cloned()
                .ok_or(EngineError::NotEnoughRuns { needed: 2, found: sealed.len() })?;
            Ok((c, p))
        }
        (None, Some(p)) => {
            let c = sealed
                .first()
                .filter(|id| **id != p)
                .cloned()
                .ok_or(EngineError::NotEnoughRuns { needed: 2, found: sealed.len() })?;
            Ok((c, p))
        }
        _ => match sealed.as_slice() {
            [c, p, ..] => Ok((c.clone(), p.clone())),
            _ => Err(EngineError::NotEnoughRuns {
                needed: 2,
                found: sealed.len(),
            }),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityHistoryEntry {
    pub run_id: RunId,
    pub total: u32,
    pub passed: u32,
    pub pass_rate: f64,
}

/// One capability across recent runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityHistory {
    pub capability: String,
    /// Newest first; runs that did not exercise the capability are omitted.
    pub entries: Vec<CapabilityHistoryEntry>,
    /// Change between the two newest entries, in percentage points.
    pub delta: Option<f64>,
    pub direction: TrendDirection,
}

/// Build per-capability history from `runs` (newest first).
pub fn capability_history(runs: &[RunSnapshot], dead_band: f64) -> Vec<CapabilityHistory> {
    let per_run: Vec<(&RunId, BTreeMap<String, (u32, u32)>)> = runs
        .iter()
        .map(|run| (run.run_id(), capability_counts(&run.outcomes)))
        .collect();
    let capabilities: BTreeSet<&String> = per_run.iter().flat_map(|(_, c)| c.keys()).collect();

    capabilities
        .into_iter()
        .map(|capability| {
            let entries: Vec<CapabilityHistoryEntry> = per_run
                .iter()
                .filter_map(|(run_id, counts)| {
                    let (passed, total) = *counts.get(capability)?;
                    Some(CapabilityHistoryEntry {
                        run_id: (*run_id).clone(),
                        total,
                        passed,
                        pass_rate: pass_rate(passed, total)?,
                    })
                })
                .collect();
            let delta = match entries.as_slice() {
                [newest, prior, ..] => Some(newest.pass_rate - prior.pass_rate),
                _ => None,
            };
            CapabilityHistory {
                capability: capability.clone(),
                entries,
                delta,
                direction: classify_trend(delta, dead_band),
            }
        })
        .collect()
}
