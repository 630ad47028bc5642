//! Missing-work scanner.
//!
//! Diffs expected input chunk indices against present output indices for
//! every session. Read-only, idempotent, and strict about failure: a listing
//! that cannot be completed yields `Err(ScanFailed)`, never an empty job —
//! conflating a transient storage error with "no work" would silently drop
//! backfill work.

use std::collections::BTreeSet;

use crate::clock::Clock;
use crate::error::{BfError, BfResult};
use crate::model::{PendingJob, PendingSession};
use crate::storage::{
    input_chunk_index, output_chunk_index, ArtifactStore, COMPLETION_MARKER,
};

/// Scan the whole store and produce the ephemeral pending-work listing.
/// Sessions appear in discovery order; missing indices ascend.
pub fn scan(store: &dyn ArtifactStore, clock: &dyn Clock) -> BfResult<PendingJob> {
    let started = clock.now();

    let units = store
        .list_units()
        .map_err(|error| BfError::ScanFailed(format!("unit listing failed: {error}")))?;

    let mut sessions = Vec::new();
    let mut sessions_scanned = 0usize;
    let mut total_missing = 0usize;

    for unit in units {
        sessions_scanned += 1;

        let objects = store.list_objects(&unit).map_err(|error| {
            BfError::ScanFailed(format!("object listing failed for `{unit}`: {error}"))
        })?;

        // Fully finished sessions carry a completion marker; skip without
        // diffing their chunk sets.
        if objects.iter().any(|name| name == COMPLETION_MARKER) {
            continue;
        }

        let mut inputs: BTreeSet<u32> = BTreeSet::new();
        let mut outputs: BTreeSet<u32> = BTreeSet::new();
        for name in &objects {
            if let Some(index) = output_chunk_index(name) {
                outputs.insert(index);
            } else if let Some(index) = input_chunk_index(name) {
                inputs.insert(index);
            }
        }

        let missing: Vec<u32> = inputs.difference(&outputs).copied().collect();
        if missing.is_empty() {
            continue;
        }

        total_missing += missing.len();
        let session_id = unit.rsplit('/').next().unwrap_or(&unit).to_owned();
        sessions.push(PendingSession {
            session_path: unit,
            session_id,
            missing_count: missing.len(),
            missing_chunks: missing,
        });
    }

    let finished = clock.now();
    let job = PendingJob {
        timestamp: started.to_rfc3339(),
        scan_duration_seconds: finished
            .signed_duration_since(started)
            .num_milliseconds() as f64
            / 1000.0,
        sessions_scanned,
        sessions_with_missing_chunks: sessions.len(),
        total_missing_chunks: total_missing,
        sessions,
    };

    tracing::info!(
        sessions_scanned = job.sessions_scanned,
        sessions_pending = job.sessions_with_missing_chunks,
        missing_chunks = job.total_missing_chunks,
        "scan complete"
    );
    Ok(job)
}
