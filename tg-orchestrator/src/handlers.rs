//! Event handling for the scheduler loop: job intake, worker channel
//! lifecycle, report accounting and job completion.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use common::{ClientId, TaskId, WorkerId};

use crate::client_registry::{JobKind, ObjectRef, TaskOutput, TaskState, TaskVariant};
use crate::core::orchestrator::{self, TaskTimings};
use crate::core::{AssignmentSink, JobSubmission, UpdateSink};
use crate::event::{SchedulerEvent, TaskOutcome, WorkerReport};
use crate::map_reduce::StageEvent;
use crate::scheduler::Scheduler;
use crate::task_queue::TaskRef;
use crate::worker_registry::WorkerRecord;

#[derive(Clone, Copy)]
enum SubTask {
    Mapper(u32),
    Reducer(u32),
}

impl Scheduler {
    /// Process one event. Returns false when the loop should stop.
    pub(crate) fn handle(&mut self, event: SchedulerEvent) -> bool {
        match event {
            SchedulerEvent::SubmitJob { submission, reply } => {
                let client_id = self.handle_submit(submission);
                let _ = reply.send(client_id);
            }
            SchedulerEvent::RegisterWorker { slots, reply } => {
                let worker_id = self.handle_register_worker(slots);
                let _ = reply.send(worker_id);
            }
            SchedulerEvent::WorkerChannelOpened {
                worker_id,
                sender,
                reply,
            } => {
                let _ = reply.send(self.handle_worker_channel(worker_id, sender));
            }
            SchedulerEvent::WorkerDisconnected { worker_id } => {
                self.handle_worker_disconnected(worker_id);
            }
            SchedulerEvent::TaskReported { report } => {
                self.apply_report(report);
                self.drain_queue();
            }
            SchedulerEvent::ClientChannelOpened {
                client_id,
                sender,
                guard,
                reply,
            } => {
                let _ = reply.send(self.handle_client_channel(client_id, sender, guard));
            }
            SchedulerEvent::ClientDisconnected { client_id } => {
                self.handle_client_disconnected(client_id);
            }
            SchedulerEvent::Shutdown => {
                info!("scheduler shutting down");
                return false;
            }
        }
        true
    }

    fn handle_submit(&mut self, submission: JobSubmission) -> ClientId {
        let client_id = self.client_ids.next();
        self.clients.register_job(client_id, submission.tasks.len());
        info!(
            "job from client {} accepted with {} tasks",
            client_id,
            submission.tasks.len()
        );

        let kind = submission.kind;
        let mut code = submission.code.into_iter();
        let first = code.next().unwrap_or_default();
        let second = code.next().unwrap_or_default();

        let mut entries = Vec::with_capacity(submission.tasks.len());
        for spec in submission.tasks {
            let task_id = self.task_ids.next();
            let variant = match kind {
                JobKind::Simple => TaskVariant::Simple {
                    code: first.clone(),
                    input: spec.input,
                },
                JobKind::MapReduce(mode) => TaskVariant::MapReduce {
                    map_code: first.clone(),
                    reduce_code: second.clone(),
                    mode,
                    input: spec.input,
                    num_mappers: spec.num_mappers,
                    num_reducers: spec.num_reducers,
                    children: Vec::new(),
                },
            };
            self.clients.add_task(client_id, task_id, variant);
            entries.push(TaskRef { client_id, task_id });
        }
        for entry in entries {
            self.dispatch(entry);
        }
        client_id
    }

    fn handle_register_worker(&mut self, slots: u32) -> WorkerId {
        let worker_id = self.worker_ids.next();
        self.pending_workers.insert(worker_id, slots);
        info!("worker {} registered with {} slots", worker_id, slots);
        worker_id
    }

    /// A worker opened its channel and said hello. The worker becomes
    /// schedulable, which may admit queued work.
    fn handle_worker_channel(
        &mut self,
        worker_id: WorkerId,
        sender: AssignmentSink,
    ) -> Result<(), Status> {
        let Some(slots) = self.pending_workers.remove(&worker_id) else {
            if self.workers.contains(worker_id) {
                return Err(Status::already_exists(format!(
                    "worker {worker_id} already has an open channel"
                )));
            }
            return Err(Status::not_found(format!(
                "worker {worker_id} is not registered"
            )));
        };
        self.workers.add(WorkerRecord {
            id: worker_id,
            max_slots: slots as usize,
            available_slots: slots as usize,
            sender,
            running: BTreeMap::new(),
        });
        info!("worker {} connected", worker_id);
        self.drain_queue();
        Ok(())
    }

    fn handle_worker_disconnected(&mut self, worker_id: WorkerId) {
        self.pending_workers.remove(&worker_id);
        if self.workers.contains(worker_id) {
            info!("worker {} disconnected", worker_id);
            self.evict_worker(worker_id);
            self.drain_queue();
        }
    }

    /// Drop a worker and put whatever it was running back on the queue,
    /// in task creation order.
    pub(crate) fn evict_worker(&mut self, worker_id: WorkerId) {
        let Some(record) = self.workers.remove(worker_id) else {
            return;
        };
        if !record.running.is_empty() {
            info!(
                "requeueing {} tasks from worker {}",
                record.running.len(),
                worker_id
            );
        }
        let entries: Vec<TaskRef> = record.running.into_values().collect();
        for entry in &entries {
            self.clients.mark_pending(*entry);
        }
        self.queue.push_all(entries);
    }

    fn apply_report(&mut self, report: WorkerReport) {
        let entry = TaskRef {
            client_id: report.client_id,
            task_id: report.task_id,
        };
        if self
            .workers
            .complete(report.worker_id, report.task_id)
            .is_none()
        {
            debug!(
                "report for task {} from worker {} with no running record",
                report.task_id, report.worker_id
            );
        }
        let Some(task) = self.clients.task(entry) else {
            warn!(
                "report for unknown task {} from worker {}",
                report.task_id, report.worker_id
            );
            return;
        };
        if task.state.is_terminal() {
            debug!("dropping duplicate report for task {}", report.task_id);
            return;
        }
        let is_root = task.variant.is_root();
        if matches!(task.state, TaskState::Pending) {
            // The task was re-queued after losing its worker, but the
            // original run finished anyway. First report wins.
            self.queue.remove(report.task_id);
        }
        if is_root {
            self.apply_root_report(entry, report);
        } else {
            self.apply_sub_task_report(entry, report);
        }
    }

    fn apply_root_report(&mut self, entry: TaskRef, report: WorkerReport) {
        let update = match report.outcome {
            TaskOutcome::Done(output) => {
                let results = match &output {
                    TaskOutput::Value(value) => vec![value.clone()],
                    TaskOutput::Partitions(refs) => {
                        refs.iter().map(|r| r.url.clone()).collect()
                    }
                    TaskOutput::Values(values) => values.clone(),
                };
                self.clients
                    .mark_done(entry, output, report.timings.clone());
                task_result_update(
                    entry.task_id,
                    orchestrator::TaskStatus::Done,
                    results,
                    String::new(),
                    report.timings,
                )
            }
            TaskOutcome::Error(message) => {
                info!(
                    "task {} failed on worker {}: {}",
                    entry.task_id, report.worker_id, message
                );
                self.clients.mark_error(entry, message.clone());
                task_result_update(
                    entry.task_id,
                    orchestrator::TaskStatus::Error,
                    Vec::new(),
                    message,
                    report.timings,
                )
            }
        };
        self.clients.push_update(entry.client_id, update);
        self.finish_job_if_complete(entry.client_id);
    }

    fn apply_sub_task_report(&mut self, entry: TaskRef, report: WorkerReport) {
        let Some(task) = self.clients.task(entry) else {
            return;
        };
        let (parent, role) = match &task.variant {
            TaskVariant::Mapper { parent, index, .. } => (*parent, SubTask::Mapper(*index)),
            TaskVariant::Reducer { parent, index, .. } => (*parent, SubTask::Reducer(*index)),
            _ => return,
        };
        let root = TaskRef {
            client_id: entry.client_id,
            task_id: parent,
        };
        match (role, report.outcome) {
            (_, TaskOutcome::Error(message)) => {
                info!(
                    "task {} failed on worker {}: {}",
                    entry.task_id, report.worker_id, message
                );
                self.clients.mark_error(entry, message.clone());
                if self.stages.abort(parent) {
                    self.fail_logical_task(root, message);
                } else {
                    debug!(
                        "failure for task {} arrived after its stage ended",
                        entry.task_id
                    );
                }
            }
            (SubTask::Mapper(index), TaskOutcome::Done(TaskOutput::Partitions(outputs))) => {
                self.clients.mark_done(
                    entry,
                    TaskOutput::Partitions(outputs.clone()),
                    report.timings.clone(),
                );
                let update = progress_update(
                    root.task_id,
                    format!("mapper {index} finished"),
                    report.timings,
                );
                self.clients.push_update(entry.client_id, update);
                self.feed_mapper(root, index, outputs);
            }
            (SubTask::Reducer(index), TaskOutcome::Done(TaskOutput::Value(value))) => {
                self.clients.mark_done(
                    entry,
                    TaskOutput::Value(value.clone()),
                    report.timings.clone(),
                );
                let update = progress_update(
                    root.task_id,
                    format!("reducer {index} finished"),
                    report.timings,
                );
                self.clients.push_update(entry.client_id, update);
                self.feed_reducer(root, index, value);
            }
            (_, TaskOutcome::Done(_)) => {
                warn!("task {} reported an unexpected output shape", entry.task_id);
                self.clients
                    .mark_error(entry, "unexpected output shape".to_string());
                if self.stages.abort(parent) {
                    self.fail_logical_task(root, "unexpected output shape".to_string());
                }
            }
        }
    }

    fn feed_mapper(&mut self, root: TaskRef, index: u32, outputs: Vec<ObjectRef>) {
        match self.stages.mapper_done(root.task_id, index, outputs) {
            Some(StageEvent::ReduceReady) => {
                debug!("task {} is ready to reduce", root.task_id);
                self.dispatch(root);
            }
            Some(_) => {}
            None => debug!("mapper report for task {} with no open stage", root.task_id),
        }
    }

    fn feed_reducer(&mut self, root: TaskRef, partition: u32, value: String) {
        match self.stages.reducer_done(root.task_id, partition, value) {
            Some(StageEvent::Finished { outputs }) => self.finalize_logical_task(root, outputs),
            Some(_) => {}
            None => debug!(
                "reducer report for task {} with no open stage",
                root.task_id
            ),
        }
    }

    fn finalize_logical_task(&mut self, root: TaskRef, outputs: Vec<String>) {
        info!(
            "two-stage task {} finished with {} results",
            root.task_id,
            outputs.len()
        );
        self.clients
            .mark_done(root, TaskOutput::Values(outputs.clone()), None);
        let update = task_result_update(
            root.task_id,
            orchestrator::TaskStatus::Done,
            outputs,
            String::new(),
            None,
        );
        self.clients.push_update(root.client_id, update);
        self.finish_job_if_complete(root.client_id);
    }

    /// Fail a two-stage root outright: queued children are withdrawn,
    /// running children are left to report into a closed stage.
    pub(crate) fn fail_logical_task(&mut self, root: TaskRef, message: String) {
        let children = match self.clients.task(root).map(|task| &task.variant) {
            Some(TaskVariant::MapReduce { children, .. }) => children.clone(),
            _ => Vec::new(),
        };
        for child in children {
            if !self.queue.remove(child) {
                continue;
            }
            let entry = TaskRef {
                client_id: root.client_id,
                task_id: child,
            };
            self.clients.mark_error(entry, "stage aborted".to_string());
        }
        self.clients.mark_error(root, message.clone());
        let update = error_update(root.task_id, message);
        self.clients.push_update(root.client_id, update);
        self.finish_job_if_complete(root.client_id);
    }

    /// If every root task of the job has reported, notify and close the
    /// result channel. A job whose client never attached keeps its
    /// buffered results until the client calls in for them.
    fn finish_job_if_complete(&mut self, client_id: ClientId) {
        let (complete, attached, ever_attached) = match self.clients.job(client_id) {
            Some(job) => (
                job.pending_tasks == 0,
                job.is_attached(),
                job.ever_attached,
            ),
            None => return,
        };
        if !complete {
            return;
        }
        if attached {
            info!("job for client {} is complete", client_id);
            self.clients.push_update(client_id, info_update("job complete"));
            self.close_job(client_id);
        } else if ever_attached {
            info!("job for client {} is complete, client gone", client_id);
            self.clients.remove_job(client_id);
        }
    }

    fn close_job(&mut self, client_id: ClientId) {
        if let Some(mut job) = self.clients.remove_job(client_id) {
            if let Some(guard) = job.take_guard() {
                guard.cancel();
            }
        }
    }

    fn handle_client_channel(
        &mut self,
        client_id: ClientId,
        sender: UpdateSink,
        guard: CancellationToken,
    ) -> Result<(), Status> {
        if !self.clients.attach_channel(client_id, sender, guard) {
            return Err(Status::not_found(format!("no job for client {client_id}")));
        }
        info!("client {} attached for results", client_id);
        self.finish_job_if_complete(client_id);
        Ok(())
    }

    /// The client dropped its result stream. Queued tasks of the job are
    /// withdrawn; running tasks finish and are accounted, but their
    /// results go undelivered.
    fn handle_client_disconnected(&mut self, client_id: ClientId) {
        let Some(job) = self.clients.job(client_id) else {
            return;
        };
        if job.channel_open() {
            // The client already reattached; this disconnect belongs to
            // the channel that was replaced.
            debug!("ignoring stale disconnect for client {}", client_id);
            return;
        }
        info!("client {} disconnected", client_id);
        self.clients.detach_channel(client_id);

        let purged = self.queue.remove_client(client_id);
        let mut failed_roots: Vec<TaskId> = Vec::new();
        for entry in &purged {
            let parent = match self.clients.task(*entry).map(|task| &task.variant) {
                Some(
                    TaskVariant::Mapper { parent, .. } | TaskVariant::Reducer { parent, .. },
                ) => Some(*parent),
                Some(_) => None,
                None => continue,
            };
            self.clients
                .mark_error(*entry, "client disconnected".to_string());
            match parent {
                Some(parent) => failed_roots.push(parent),
                None => {
                    self.stages.abort(entry.task_id);
                }
            }
        }
        for root in failed_roots {
            if self.stages.abort(root) {
                self.fail_logical_task(
                    TaskRef {
                        client_id,
                        task_id: root,
                    },
                    "client disconnected".to_string(),
                );
            }
        }
        self.finish_job_if_complete(client_id);
        self.drain_queue();
    }
}

fn task_result_update(
    task_id: TaskId,
    status: orchestrator::TaskStatus,
    results: Vec<String>,
    error: String,
    timings: Option<TaskTimings>,
) -> orchestrator::ClientUpdate {
    orchestrator::ClientUpdate {
        kind: orchestrator::UpdateKind::TaskResult as i32,
        task_id: task_id.into(),
        status: status as i32,
        results,
        error,
        timings,
        note: String::new(),
    }
}

fn progress_update(
    task_id: TaskId,
    note: String,
    timings: Option<TaskTimings>,
) -> orchestrator::ClientUpdate {
    orchestrator::ClientUpdate {
        kind: orchestrator::UpdateKind::Info as i32,
        task_id: task_id.into(),
        note,
        timings,
        ..Default::default()
    }
}

fn info_update(note: &str) -> orchestrator::ClientUpdate {
    orchestrator::ClientUpdate {
        kind: orchestrator::UpdateKind::Info as i32,
        note: note.to_string(),
        ..Default::default()
    }
}

fn error_update(task_id: TaskId, error: String) -> orchestrator::ClientUpdate {
    orchestrator::ClientUpdate {
        kind: orchestrator::UpdateKind::Error as i32,
        task_id: task_id.into(),
        status: orchestrator::TaskStatus::Error as i32,
        error,
        ..Default::default()
    }
}
