//! Stage tracking for two-stage tasks.
//!
//! One stage record per map/reduce root counts mapper and reducer
//! completions, collects their output references, and assembles reducer
//! inputs once the map phase drains. There is no shuffle tier here;
//! intermediate data only ever moves through the blob store by reference.

use std::collections::HashMap;

use anyhow::{bail, Result};

use common::TaskId;

use crate::client_registry::{ObjectRef, ReduceMode};

/// Where a stage stands in its two-phase lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    /// Mappers dispatched, `remaining` of them yet to report.
    Mapping { remaining: u32 },
    /// Every mapper reported; reducers not yet dispatched.
    ReduceReady,
    /// Reducers dispatched, `remaining` of them yet to report.
    Reducing { remaining: u32 },
}

/// What feeding one completion into a stage amounted to.
#[derive(Debug, PartialEq)]
pub enum StageEvent {
    /// The stage is still waiting on more completions.
    Progress,
    /// The map phase drained; the root should dispatch its reducers.
    ReduceReady,
    /// The reduce phase drained; outputs are in partition order and the
    /// stage record is gone.
    Finished { outputs: Vec<String> },
}

#[derive(Debug)]
struct StageState {
    phase: StagePhase,
    mode: ReduceMode,
    num_mappers: u32,
    num_reducers: u32,
    /// Mapper output references by mapper index, present once reported.
    mapper_outputs: Vec<Option<Vec<ObjectRef>>>,
    /// Reducer results by partition, present once reported.
    reducer_outputs: Vec<Option<String>>,
}

#[derive(Debug, Default)]
pub struct MapReduceCoordinator {
    stages: HashMap<TaskId, StageState>,
}

impl MapReduceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stage for a root entering its map phase.
    pub fn begin(&mut self, root: TaskId, mode: ReduceMode, num_mappers: u32, num_reducers: u32) {
        self.stages.insert(
            root,
            StageState {
                phase: StagePhase::Mapping {
                    remaining: num_mappers,
                },
                mode,
                num_mappers,
                num_reducers,
                mapper_outputs: vec![None; num_mappers as usize],
                reducer_outputs: vec![None; num_reducers as usize],
            },
        );
    }

    pub fn phase(&self, root: TaskId) -> Option<StagePhase> {
        self.stages.get(&root).map(|stage| stage.phase)
    }

    /// Move a reduce-ready stage into its reducing phase.
    pub fn begin_reduce(&mut self, root: TaskId) {
        if let Some(stage) = self.stages.get_mut(&root) {
            if matches!(stage.phase, StagePhase::ReduceReady) {
                stage.phase = StagePhase::Reducing {
                    remaining: stage.num_reducers,
                };
            }
        }
    }

    /// Record one mapper completion. A duplicate report for an already
    /// recorded mapper index does not advance the count.
    pub fn mapper_done(
        &mut self,
        root: TaskId,
        index: u32,
        outputs: Vec<ObjectRef>,
    ) -> Option<StageEvent> {
        let stage = self.stages.get_mut(&root)?;
        let slot = stage.mapper_outputs.get_mut(index as usize)?;
        if slot.is_some() {
            return Some(StageEvent::Progress);
        }
        *slot = Some(outputs);

        match stage.phase {
            StagePhase::Mapping { remaining } if remaining <= 1 => {
                stage.phase = StagePhase::ReduceReady;
                Some(StageEvent::ReduceReady)
            }
            StagePhase::Mapping { remaining } => {
                stage.phase = StagePhase::Mapping {
                    remaining: remaining - 1,
                };
                Some(StageEvent::Progress)
            }
            _ => Some(StageEvent::Progress),
        }
    }

    /// Record one reducer completion. Returns the assembled result once
    /// every partition has reported, dropping the stage record.
    pub fn reducer_done(&mut self, root: TaskId, partition: u32, value: String) -> Option<StageEvent> {
        let stage = self.stages.get_mut(&root)?;
        let slot = stage.reducer_outputs.get_mut(partition as usize)?;
        if slot.is_some() {
            return Some(StageEvent::Progress);
        }
        *slot = Some(value);

        let drained = match stage.phase {
            StagePhase::Reducing { remaining } if remaining <= 1 => true,
            StagePhase::Reducing { remaining } => {
                stage.phase = StagePhase::Reducing {
                    remaining: remaining - 1,
                };
                false
            }
            _ => false,
        };
        if !drained {
            return Some(StageEvent::Progress);
        }

        let outputs = match self.stages.remove(&root) {
            Some(stage) => stage
                .reducer_outputs
                .into_iter()
                .map(|output| output.unwrap_or_default())
                .collect(),
            None => Vec::new(),
        };
        Some(StageEvent::Finished { outputs })
    }

    /// Build the input set for each reducer partition from the recorded
    /// mapper outputs.
    ///
    /// Aggregate mode hands the single reducer every mapper reference, in
    /// mapper order. Partitioned mode gives reducer r the r-tagged
    /// reference of every mapper, which requires each mapper to have
    /// produced exactly one reference per partition.
    pub fn reconstruct_inputs(&self, root: TaskId) -> Result<Vec<Vec<ObjectRef>>> {
        let Some(stage) = self.stages.get(&root) else {
            bail!("no stage for task {root}");
        };

        let mut mappers = Vec::with_capacity(stage.num_mappers as usize);
        for (index, outputs) in stage.mapper_outputs.iter().enumerate() {
            match outputs {
                Some(outputs) => mappers.push((index, outputs)),
                None => bail!("mapper {index} of task {root} never reported its outputs"),
            }
        }

        match stage.mode {
            ReduceMode::Aggregate => {
                let refs = mappers
                    .iter()
                    .flat_map(|(_, outputs)| outputs.iter().cloned())
                    .collect();
                Ok(vec![refs])
            }
            ReduceMode::Partitioned => {
                for (index, outputs) in &mappers {
                    if outputs.len() != stage.num_reducers as usize {
                        bail!(
                            "mapper {index} of task {root} produced {} partitions, expected {}",
                            outputs.len(),
                            stage.num_reducers
                        );
                    }
                }
                let mut inputs = Vec::with_capacity(stage.num_reducers as usize);
                for partition in 0..stage.num_reducers {
                    let mut refs = Vec::with_capacity(mappers.len());
                    for (index, outputs) in &mappers {
                        let mut tagged = outputs.iter().filter(|r| r.partition == partition);
                        match (tagged.next(), tagged.next()) {
                            (Some(reference), None) => refs.push(reference.clone()),
                            (None, _) => {
                                bail!("mapper {index} of task {root} is missing partition {partition}")
                            }
                            (Some(_), Some(_)) => {
                                bail!("mapper {index} of task {root} repeats partition {partition}")
                            }
                        }
                    }
                    inputs.push(refs);
                }
                Ok(inputs)
            }
        }
    }

    /// Drop all stage state for an aborted root. Returns whether a stage
    /// was actually open.
    pub fn abort(&mut self, root: TaskId) -> bool {
        self.stages.remove(&root).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(mapper: u32, partitions: u32) -> Vec<ObjectRef> {
        (0..partitions)
            .map(|partition| ObjectRef {
                partition,
                url: format!("s3://scratch/map/{mapper}-{partition}"),
            })
            .collect()
    }

    #[test]
    fn test_map_phase_drains_to_reduce_ready() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(1);
        stages.begin(root, ReduceMode::Partitioned, 3, 2);
        assert_eq!(
            stages.phase(root),
            Some(StagePhase::Mapping { remaining: 3 })
        );

        assert_eq!(
            stages.mapper_done(root, 0, refs(0, 2)),
            Some(StageEvent::Progress)
        );
        assert_eq!(
            stages.mapper_done(root, 2, refs(2, 2)),
            Some(StageEvent::Progress)
        );
        assert_eq!(
            stages.mapper_done(root, 1, refs(1, 2)),
            Some(StageEvent::ReduceReady)
        );
        assert_eq!(stages.phase(root), Some(StagePhase::ReduceReady));
    }

    #[test]
    fn test_duplicate_mapper_report_does_not_advance() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(1);
        stages.begin(root, ReduceMode::Partitioned, 2, 1);

        assert_eq!(
            stages.mapper_done(root, 0, refs(0, 1)),
            Some(StageEvent::Progress)
        );
        assert_eq!(
            stages.mapper_done(root, 0, refs(0, 1)),
            Some(StageEvent::Progress)
        );
        assert_eq!(
            stages.phase(root),
            Some(StagePhase::Mapping { remaining: 1 })
        );
        assert_eq!(
            stages.mapper_done(root, 1, refs(1, 1)),
            Some(StageEvent::ReduceReady)
        );
    }

    #[test]
    fn test_aggregate_inputs_concatenate_in_mapper_order() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(4);
        stages.begin(root, ReduceMode::Aggregate, 2, 1);
        stages.mapper_done(root, 1, refs(1, 1));
        stages.mapper_done(root, 0, refs(0, 1));

        let inputs = stages.reconstruct_inputs(root).unwrap();
        assert_eq!(inputs.len(), 1);
        let urls: Vec<&str> = inputs[0].iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["s3://scratch/map/0-0", "s3://scratch/map/1-0"]);
    }

    #[test]
    fn test_partitioned_inputs_select_one_reference_per_mapper() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(4);
        stages.begin(root, ReduceMode::Partitioned, 2, 3);
        stages.mapper_done(root, 0, refs(0, 3));
        stages.mapper_done(root, 1, refs(1, 3));

        let inputs = stages.reconstruct_inputs(root).unwrap();
        assert_eq!(inputs.len(), 3);
        for (partition, input) in inputs.iter().enumerate() {
            assert_eq!(input.len(), 2);
            assert!(input.iter().all(|r| r.partition == partition as u32));
            assert_eq!(input[0].url, format!("s3://scratch/map/0-{partition}"));
            assert_eq!(input[1].url, format!("s3://scratch/map/1-{partition}"));
        }
    }

    #[test]
    fn test_partition_count_mismatch_fails_reconstruction() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(4);
        stages.begin(root, ReduceMode::Partitioned, 2, 2);
        stages.mapper_done(root, 0, refs(0, 2));
        stages.mapper_done(root, 1, refs(1, 1));

        let err = stages.reconstruct_inputs(root).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_missing_partition_tag_fails_reconstruction() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(4);
        stages.begin(root, ReduceMode::Partitioned, 1, 2);
        // Two references both tagged partition 0.
        stages.mapper_done(
            root,
            0,
            vec![
                ObjectRef {
                    partition: 0,
                    url: "s3://scratch/a".to_string(),
                },
                ObjectRef {
                    partition: 0,
                    url: "s3://scratch/b".to_string(),
                },
            ],
        );

        let err = stages.reconstruct_inputs(root).unwrap_err();
        assert!(err.to_string().contains("partition"));
    }

    #[test]
    fn test_reduce_phase_finishes_in_partition_order() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(9);
        stages.begin(root, ReduceMode::Partitioned, 1, 2);
        stages.mapper_done(root, 0, refs(0, 2));
        stages.begin_reduce(root);
        assert_eq!(
            stages.phase(root),
            Some(StagePhase::Reducing { remaining: 2 })
        );

        assert_eq!(
            stages.reducer_done(root, 1, "second".to_string()),
            Some(StageEvent::Progress)
        );
        let finished = stages.reducer_done(root, 0, "first".to_string());
        assert_eq!(
            finished,
            Some(StageEvent::Finished {
                outputs: vec!["first".to_string(), "second".to_string()],
            })
        );
        assert_eq!(stages.phase(root), None);
    }

    #[test]
    fn test_abort_drops_the_stage() {
        let mut stages = MapReduceCoordinator::new();
        let root = TaskId::from(2);
        stages.begin(root, ReduceMode::Aggregate, 1, 1);

        assert!(stages.abort(root));
        assert!(!stages.abort(root));
        assert_eq!(stages.mapper_done(root, 0, refs(0, 1)), None);
    }
}
