//! Remapping of attribution tables from worker slots to participants
//!
//! Worker slot `i` always belongs to the i-th smallest participant id, so
//! the remap pairs sorted ids with slots `0..worker_number`.

use std::collections::{BTreeMap, BTreeSet};

use runtime_core::{
    Error, ParticipantAttribution, ParticipantId, Result, ResultFragment, SlotAttribution,
    TrainingStats,
};

/// Rekey every round of `table` by participant id
pub fn remap_shapley_values(
    table: &SlotAttribution,
    practitioner_ids: &BTreeSet<ParticipantId>,
    worker_number: usize,
) -> Result<ParticipantAttribution> {
    if worker_number != practitioner_ids.len() {
        return Err(Error::AttributionMismatch {
            worker_number,
            participants: practitioner_ids.len(),
        });
    }

    table
        .iter()
        .map(|(&round, by_slot)| {
            let by_participant = practitioner_ids
                .iter()
                .zip(0..worker_number)
                .map(|(pid, slot)| {
                    by_slot
                        .get(&slot)
                        .map(|value| (pid.clone(), *value))
                        .ok_or(Error::MissingWorkerSlot { round, slot })
                })
                .collect::<Result<BTreeMap<_, _>>>()?;
            Ok((round, by_participant))
        })
        .collect()
}

/// Turn the accumulated results of a finished task into caller facing stats
pub fn assemble_stats(
    accumulated: ResultFragment,
    practitioner_ids: &BTreeSet<ParticipantId>,
    worker_number: usize,
) -> Result<TrainingStats> {
    let shapley_values = accumulated
        .shapley_values
        .as_ref()
        .map(|table| remap_shapley_values(table, practitioner_ids, worker_number))
        .transpose()?;

    Ok(TrainingStats {
        metrics: accumulated.metrics,
        shapley_values,
    })
}
