//! Task placement: immediate assignment where capacity allows, the
//! queue where it does not.
//!
//! Simple tasks and re-queued stage children take one slot on the
//! freest worker. Two-stage roots fan out a cohort (all mappers, then
//! all reducers) under an all-or-nothing admission rule: unless every
//! member of the cohort can be placed at once, the root waits in the
//! queue and is re-attempted on every capacity change.

use tracing::{debug, error, warn};

use common::WorkerId;

use crate::client_registry::{ObjectRef, TaskVariant};
use crate::core::orchestrator;
use crate::map_reduce::StagePhase;
use crate::scheduler::Scheduler;
use crate::task_queue::TaskRef;

impl Scheduler {
    /// Place a task on workers, or queue it. Two-stage roots fan out a
    /// cohort; every other variant runs as a single assignment.
    pub(crate) fn dispatch(&mut self, entry: TaskRef) -> bool {
        let is_cohort = match self.clients.task(entry) {
            Some(task) => matches!(task.variant, TaskVariant::MapReduce { .. }),
            None => {
                debug!("dropping dispatch for unknown task {}", entry.task_id);
                return false;
            }
        };
        if is_cohort {
            self.dispatch_cohort(entry)
        } else {
            self.dispatch_single(entry)
        }
    }

    /// Dispatch queued tasks in order while capacity allows. The head
    /// entry blocks the queue until it can be admitted; nothing
    /// overtakes it.
    pub(crate) fn drain_queue(&mut self) {
        let mut budget = self.queue.len();
        while budget > 0 {
            budget -= 1;
            let Some(entry) = self.queue.peek_front() else {
                break;
            };
            let Some(needed) = self.required_slots(entry) else {
                self.queue.pop_front();
                continue;
            };
            if self.workers.total_available() < needed {
                break;
            }
            self.queue.pop_front();
            self.dispatch(entry);
        }
    }

    fn dispatch_single(&mut self, entry: TaskRef) -> bool {
        let Some(worker_id) = self.workers.best_workers(1).into_iter().next() else {
            self.queue.push(entry);
            return false;
        };
        let Some(assignment) = self.build_assignment(entry) else {
            return false;
        };
        self.send_assignment(worker_id, entry, assignment)
    }

    fn dispatch_cohort(&mut self, entry: TaskRef) -> bool {
        match self.stages.phase(entry.task_id) {
            None => self.dispatch_map_stage(entry),
            Some(StagePhase::ReduceReady) => self.dispatch_reduce_stage(entry),
            Some(_) => {
                warn!(
                    "two-stage task {} dispatched while mid-stage, ignoring",
                    entry.task_id
                );
                false
            }
        }
    }

    /// Fan out the map phase: one mapper child per input byte range, all
    /// placed in the same step.
    fn dispatch_map_stage(&mut self, entry: TaskRef) -> bool {
        let Some(task) = self.clients.task(entry) else {
            debug!("dropping dispatch for unknown task {}", entry.task_id);
            return false;
        };
        let TaskVariant::MapReduce {
            map_code,
            mode,
            input,
            num_mappers,
            num_reducers,
            ..
        } = &task.variant
        else {
            return false;
        };
        let (map_code, input) = (map_code.clone(), input.clone());
        let (mode, num_mappers, num_reducers) = (*mode, *num_mappers, *num_reducers);

        let Some(plan) = self.plan_cohort(num_mappers as usize) else {
            debug!(
                "not enough capacity for {} mappers of task {}, queueing",
                num_mappers, entry.task_id
            );
            self.queue.push(entry);
            return false;
        };

        self.stages
            .begin(entry.task_id, mode, num_mappers, num_reducers);

        for (index, worker_id) in plan.into_iter().enumerate() {
            let task_id = self.task_ids.next();
            let child = TaskRef {
                client_id: entry.client_id,
                task_id,
            };
            self.clients.add_sub_task(
                entry.client_id,
                entry.task_id,
                task_id,
                TaskVariant::Mapper {
                    parent: entry.task_id,
                    code: map_code.clone(),
                    input: input.clone(),
                    index: index as u32,
                    num_mappers,
                    num_reducers,
                },
            );
            if let Some(assignment) = self.build_assignment(child) {
                self.send_assignment(worker_id, child, assignment);
            }
        }
        true
    }

    /// Fan out the reduce phase once admission is granted: reducer
    /// inputs are assembled from the recorded mapper outputs before
    /// anything is sent, and an assembly failure aborts the whole root.
    fn dispatch_reduce_stage(&mut self, entry: TaskRef) -> bool {
        let Some(task) = self.clients.task(entry) else {
            debug!("dropping dispatch for unknown task {}", entry.task_id);
            return false;
        };
        let TaskVariant::MapReduce {
            reduce_code,
            num_reducers,
            ..
        } = &task.variant
        else {
            return false;
        };
        let (reduce_code, num_reducers) = (reduce_code.clone(), *num_reducers);

        let Some(plan) = self.plan_cohort(num_reducers as usize) else {
            debug!(
                "not enough capacity for {} reducers of task {}, queueing",
                num_reducers, entry.task_id
            );
            self.queue.push(entry);
            return false;
        };

        let inputs = match self.stages.reconstruct_inputs(entry.task_id) {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(
                    "cannot assemble reduce inputs for task {}: {err:#}",
                    entry.task_id
                );
                self.stages.abort(entry.task_id);
                self.fail_logical_task(entry, format!("{err:#}"));
                return false;
            }
        };

        self.stages.begin_reduce(entry.task_id);

        for ((index, worker_id), inputs) in plan.into_iter().enumerate().zip(inputs) {
            let task_id = self.task_ids.next();
            let child = TaskRef {
                client_id: entry.client_id,
                task_id,
            };
            self.clients.add_sub_task(
                entry.client_id,
                entry.task_id,
                task_id,
                TaskVariant::Reducer {
                    parent: entry.task_id,
                    code: reduce_code.clone(),
                    inputs,
                    index: index as u32,
                },
            );
            if let Some(assignment) = self.build_assignment(child) {
                self.send_assignment(worker_id, child, assignment);
            }
        }
        true
    }

    /// Choose a worker for each of `needed` cohort members, spreading
    /// members round-robin across the freest workers. None unless every
    /// member can be placed at once.
    fn plan_cohort(&self, needed: usize) -> Option<Vec<WorkerId>> {
        if self.workers.total_available() < needed {
            return None;
        }
        let mut budgets: Vec<(WorkerId, usize)> = self
            .workers
            .best_workers(needed)
            .into_iter()
            .filter_map(|id| {
                self.workers
                    .get(id)
                    .map(|record| (id, record.available_slots))
            })
            .collect();

        let mut plan = Vec::with_capacity(needed);
        while plan.len() < needed {
            let mut placed = false;
            for (worker_id, budget) in budgets.iter_mut() {
                if plan.len() == needed {
                    break;
                }
                if *budget == 0 {
                    continue;
                }
                *budget -= 1;
                plan.push(*worker_id);
                placed = true;
            }
            if !placed {
                return None;
            }
        }
        Some(plan)
    }

    /// Slots the queue-head entry needs before it can be admitted, or
    /// None if the entry is stale and should be dropped from the queue.
    fn required_slots(&self, entry: TaskRef) -> Option<usize> {
        let task = match self.clients.task(entry) {
            Some(task) => task,
            None => {
                debug!("dropping queued task {} with no record", entry.task_id);
                return None;
            }
        };
        match &task.variant {
            TaskVariant::Simple { .. }
            | TaskVariant::Mapper { .. }
            | TaskVariant::Reducer { .. } => Some(1),
            TaskVariant::MapReduce {
                num_mappers,
                num_reducers,
                ..
            } => match self.stages.phase(entry.task_id) {
                None => Some(*num_mappers as usize),
                Some(StagePhase::ReduceReady) => Some(*num_reducers as usize),
                Some(_) => {
                    warn!(
                        "queued two-stage task {} is already mid-stage, dropping",
                        entry.task_id
                    );
                    None
                }
            },
        }
    }

    fn build_assignment(&self, entry: TaskRef) -> Option<orchestrator::TaskAssignment> {
        let task = self.clients.task(entry)?;
        let assignment = match &task.variant {
            TaskVariant::Simple { code, input } => orchestrator::TaskAssignment {
                client_id: entry.client_id.into(),
                task_id: entry.task_id.into(),
                kind: orchestrator::TaskKind::Simple as i32,
                code: code.clone(),
                input: input.clone(),
                inputs: Vec::new(),
                num_mappers: 0,
                num_reducers: 0,
                worker_index: 0,
            },
            TaskVariant::Mapper {
                code,
                input,
                index,
                num_mappers,
                num_reducers,
                ..
            } => orchestrator::TaskAssignment {
                client_id: entry.client_id.into(),
                task_id: entry.task_id.into(),
                kind: orchestrator::TaskKind::Mapper as i32,
                code: code.clone(),
                input: input.clone(),
                inputs: Vec::new(),
                num_mappers: *num_mappers,
                num_reducers: *num_reducers,
                worker_index: *index,
            },
            TaskVariant::Reducer {
                code,
                inputs,
                index,
                ..
            } => orchestrator::TaskAssignment {
                client_id: entry.client_id.into(),
                task_id: entry.task_id.into(),
                kind: orchestrator::TaskKind::Reducer as i32,
                code: code.clone(),
                input: String::new(),
                inputs: inputs.iter().map(to_proto_ref).collect(),
                num_mappers: 0,
                num_reducers: 0,
                worker_index: *index,
            },
            TaskVariant::MapReduce { .. } => return None,
        };
        Some(assignment)
    }

    /// Hand one assignment to a worker, with records updated first so a
    /// send failure can roll everything back. A failed send treats the
    /// worker as disconnected and returns the task to the queue.
    fn send_assignment(
        &mut self,
        worker_id: WorkerId,
        entry: TaskRef,
        assignment: orchestrator::TaskAssignment,
    ) -> bool {
        let Some(sender) = self
            .workers
            .get(worker_id)
            .map(|record| record.sender.clone())
        else {
            self.queue.push(entry);
            return false;
        };
        if !self.workers.assign(worker_id, entry) {
            self.queue.push(entry);
            return false;
        }
        self.clients.mark_running(entry, worker_id);
        debug!("assigned task {} to worker {}", entry.task_id, worker_id);

        if sender.send(Ok(assignment)).is_err() {
            error!(
                "send to worker {} failed, rolling back task {}",
                worker_id, entry.task_id
            );
            self.workers.complete(worker_id, entry.task_id);
            self.clients.revert_assignment(entry, worker_id);
            self.evict_worker(worker_id);
            self.queue.push(entry);
            return false;
        }
        true
    }
}

fn to_proto_ref(reference: &ObjectRef) -> orchestrator::ObjectRef {
    orchestrator::ObjectRef {
        partition: reference.partition,
        url: reference.url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::mpsc;

    use crate::worker_registry::WorkerRecord;

    use super::*;

    type AssignmentRx =
        mpsc::UnboundedReceiver<Result<orchestrator::TaskAssignment, tonic::Status>>;

    fn scheduler_with_workers(slots: &[usize]) -> (Scheduler, Vec<AssignmentRx>) {
        let mut scheduler = Scheduler::new();
        let mut receivers = Vec::new();
        for (index, &slots) in slots.iter().enumerate() {
            let (sender, receiver) = mpsc::unbounded_channel();
            receivers.push(receiver);
            scheduler.workers.add(WorkerRecord {
                id: WorkerId::from(index as u64 + 1),
                max_slots: slots,
                available_slots: slots,
                sender,
                running: BTreeMap::new(),
            });
        }
        (scheduler, receivers)
    }

    #[test]
    fn test_plan_cohort_spreads_round_robin() {
        let (scheduler, _receivers) = scheduler_with_workers(&[3, 1]);

        let plan = scheduler.plan_cohort(4).unwrap();
        assert_eq!(
            plan,
            vec![
                WorkerId::from(1),
                WorkerId::from(2),
                WorkerId::from(1),
                WorkerId::from(1),
            ]
        );
    }

    #[test]
    fn test_plan_cohort_is_all_or_nothing() {
        let (scheduler, _receivers) = scheduler_with_workers(&[2, 2]);
        assert!(scheduler.plan_cohort(5).is_none());
        assert_eq!(scheduler.plan_cohort(4).map(|p| p.len()), Some(4));
        assert_eq!(scheduler.plan_cohort(0).map(|p| p.len()), Some(0));
    }

    #[test]
    fn test_plan_cohort_uses_capacity_beyond_the_first_pick() {
        // One worker cannot hold the whole cohort, two together can.
        let (scheduler, _receivers) = scheduler_with_workers(&[2, 2, 1]);
        let plan = scheduler.plan_cohort(5).unwrap();

        let mut counts = BTreeMap::new();
        for worker in plan {
            *counts.entry(worker).or_insert(0) += 1;
        }
        assert_eq!(counts.get(&WorkerId::from(1)), Some(&2));
        assert_eq!(counts.get(&WorkerId::from(2)), Some(&2));
        assert_eq!(counts.get(&WorkerId::from(3)), Some(&1));
    }
}
