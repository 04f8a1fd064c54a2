//! Per-job state owned by the scheduler: every task record, its
//! lifecycle, and the update channel back to the submitting client.
//!
//! Tasks live in a flat per-job map addressed by generated ids; stage
//! children point back at their root through the variant's `parent`
//! field. Updates produced while no channel is attached are buffered on
//! the job and replayed on attach.

use std::collections::HashMap;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use common::{ClientId, TaskId, WorkerId};

use crate::core::orchestrator::{ClientUpdate, TaskTimings};
use crate::core::UpdateSink;
use crate::task_queue::TaskRef;

/// Reference to one partition of data in the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub partition: u32,
    pub url: String,
}

/// How reducer inputs are derived from mapper outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceMode {
    /// A single reducer consumes every mapper output.
    Aggregate,
    /// Reducer r consumes the r-tagged output of every mapper.
    Partitioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Simple,
    MapReduce(ReduceMode),
}

/// Lifecycle of a single task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Error { message: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error { .. })
    }
}

/// What a task record stands for. Roots are the units the client
/// submitted; mappers and reducers are stage children of a two-stage
/// root.
#[derive(Debug, Clone)]
pub enum TaskVariant {
    Simple {
        code: String,
        input: String,
    },
    MapReduce {
        map_code: String,
        reduce_code: String,
        mode: ReduceMode,
        input: String,
        num_mappers: u32,
        num_reducers: u32,
        children: Vec<TaskId>,
    },
    Mapper {
        parent: TaskId,
        code: String,
        input: String,
        index: u32,
        num_mappers: u32,
        num_reducers: u32,
    },
    Reducer {
        parent: TaskId,
        code: String,
        inputs: Vec<ObjectRef>,
        index: u32,
    },
}

impl TaskVariant {
    /// Whether this record is a unit of the submitted job rather than a
    /// stage child.
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            TaskVariant::Simple { .. } | TaskVariant::MapReduce { .. }
        )
    }
}

/// One dispatch of a task to a worker.
#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    pub worker: WorkerId,
    pub at: SystemTime,
}

/// Recorded output of a finished task.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    /// Mapper output references, one per partition.
    Partitions(Vec<ObjectRef>),
    /// A single result value or output URL.
    Value(String),
    /// Assembled two-stage results in partition order.
    Values(Vec<String>),
}

#[derive(Debug)]
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub variant: TaskVariant,
    /// Dispatch history, most recent last.
    pub assignments: Vec<Assignment>,
    pub output: Option<TaskOutput>,
    pub timings: Option<TaskTimings>,
}

/// All state for one submitted job.
#[derive(Debug)]
pub struct JobRecord {
    pub id: ClientId,
    pub total_tasks: usize,
    /// Root tasks not yet in a terminal state.
    pub pending_tasks: usize,
    pub tasks: HashMap<TaskId, TaskRecord>,
    channel: Option<UpdateSink>,
    guard: Option<CancellationToken>,
    /// Updates produced while no channel was attached, in order.
    buffered: Vec<ClientUpdate>,
    /// Whether a result channel was ever attached.
    pub ever_attached: bool,
}

impl JobRecord {
    pub fn is_attached(&self) -> bool {
        self.channel.is_some()
    }

    /// Whether the attached channel still has a live receiving side.
    pub fn channel_open(&self) -> bool {
        self.channel
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    pub fn take_guard(&mut self) -> Option<CancellationToken> {
        self.guard.take()
    }

    /// Send an update down the channel, or buffer it when there is none.
    /// A send failure means the receiver vanished before its disconnect
    /// event; the update goes back to the buffer.
    fn deliver(&mut self, update: ClientUpdate) {
        match self.channel.as_ref() {
            Some(sender) => {
                if let Err(unsent) = sender.send(Ok(update)) {
                    self.channel = None;
                    if let Ok(update) = unsent.0 {
                        self.buffered.push(update);
                    }
                }
            }
            None => self.buffered.push(update),
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    jobs: HashMap<ClientId, JobRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty job record for a fresh submission.
    pub fn register_job(&mut self, client_id: ClientId, total_tasks: usize) {
        self.jobs.insert(
            client_id,
            JobRecord {
                id: client_id,
                total_tasks,
                pending_tasks: total_tasks,
                tasks: HashMap::new(),
                channel: None,
                guard: None,
                buffered: Vec::new(),
                ever_attached: false,
            },
        );
    }

    pub fn remove_job(&mut self, client_id: ClientId) -> Option<JobRecord> {
        self.jobs.remove(&client_id)
    }

    pub fn job(&self, client_id: ClientId) -> Option<&JobRecord> {
        self.jobs.get(&client_id)
    }

    /// Add a root task record in pending state.
    pub fn add_task(&mut self, client_id: ClientId, task_id: TaskId, variant: TaskVariant) {
        if let Some(job) = self.jobs.get_mut(&client_id) {
            job.tasks.insert(task_id, new_record(task_id, variant));
        }
    }

    /// Add a stage child and link it under its root.
    pub fn add_sub_task(
        &mut self,
        client_id: ClientId,
        parent: TaskId,
        task_id: TaskId,
        variant: TaskVariant,
    ) {
        let Some(job) = self.jobs.get_mut(&client_id) else {
            return;
        };
        job.tasks.insert(task_id, new_record(task_id, variant));
        if let Some(root) = job.tasks.get_mut(&parent) {
            if let TaskVariant::MapReduce { children, .. } = &mut root.variant {
                children.push(task_id);
            }
        }
    }

    pub fn task(&self, entry: TaskRef) -> Option<&TaskRecord> {
        self.jobs.get(&entry.client_id)?.tasks.get(&entry.task_id)
    }

    pub fn task_mut(&mut self, entry: TaskRef) -> Option<&mut TaskRecord> {
        self.jobs
            .get_mut(&entry.client_id)?
            .tasks
            .get_mut(&entry.task_id)
    }

    /// Look up a stage child, verifying it really hangs off the given
    /// root.
    pub fn sub_task(
        &self,
        client_id: ClientId,
        parent: TaskId,
        sub_task_id: TaskId,
    ) -> Option<&TaskRecord> {
        let record = self.jobs.get(&client_id)?.tasks.get(&sub_task_id)?;
        let linked = match &record.variant {
            TaskVariant::Mapper { parent: p, .. } | TaskVariant::Reducer { parent: p, .. } => {
                *p == parent
            }
            _ => false,
        };
        linked.then_some(record)
    }

    /// Move a task to running, recording the assignment.
    pub fn mark_running(&mut self, entry: TaskRef, worker: WorkerId) {
        if let Some(task) = self.task_mut(entry) {
            task.state = TaskState::Running;
            task.assignments.push(Assignment {
                worker,
                at: SystemTime::now(),
            });
        }
    }

    /// Put a task back to pending, keeping its assignment history.
    pub fn mark_pending(&mut self, entry: TaskRef) {
        if let Some(task) = self.task_mut(entry) {
            task.state = TaskState::Pending;
        }
    }

    /// Undo the record of a dispatch whose send never reached the
    /// worker.
    pub fn revert_assignment(&mut self, entry: TaskRef, worker: WorkerId) {
        if let Some(task) = self.task_mut(entry) {
            task.state = TaskState::Pending;
            if let Some(position) = task.assignments.iter().rposition(|a| a.worker == worker) {
                task.assignments.remove(position);
            }
        }
    }

    pub fn mark_done(&mut self, entry: TaskRef, output: TaskOutput, timings: Option<TaskTimings>) {
        self.finish(entry, TaskState::Done, Some(output), timings);
    }

    pub fn mark_error(&mut self, entry: TaskRef, message: String) {
        self.finish(entry, TaskState::Error { message }, None, None);
    }

    /// Whether every root task of the job is terminal. False for unknown
    /// jobs.
    pub fn all_tasks_complete(&self, client_id: ClientId) -> bool {
        self.jobs
            .get(&client_id)
            .map(|job| job.pending_tasks == 0)
            .unwrap_or(false)
    }

    /// Send an update to the job's client, buffering it if no channel is
    /// attached yet.
    pub fn push_update(&mut self, client_id: ClientId, update: ClientUpdate) {
        if let Some(job) = self.jobs.get_mut(&client_id) {
            job.deliver(update);
        }
    }

    /// Attach a result channel, replacing and cancelling any previous
    /// one, then replay updates buffered while the job was unattached.
    /// Returns false for an unknown job.
    pub fn attach_channel(
        &mut self,
        client_id: ClientId,
        sender: UpdateSink,
        guard: CancellationToken,
    ) -> bool {
        let Some(job) = self.jobs.get_mut(&client_id) else {
            return false;
        };
        if let Some(old) = job.guard.take() {
            old.cancel();
        }
        job.channel = Some(sender);
        job.guard = Some(guard);
        job.ever_attached = true;
        for update in std::mem::take(&mut job.buffered) {
            job.deliver(update);
        }
        true
    }

    /// Drop the job's channel after its receiving side went away.
    pub fn detach_channel(&mut self, client_id: ClientId) {
        if let Some(job) = self.jobs.get_mut(&client_id) {
            job.channel = None;
            job.guard = None;
        }
    }

    /// Terminal transition. The job's pending count goes down exactly
    /// once per root task, on its first transition into a terminal
    /// state.
    fn finish(
        &mut self,
        entry: TaskRef,
        state: TaskState,
        output: Option<TaskOutput>,
        timings: Option<TaskTimings>,
    ) {
        let Some(job) = self.jobs.get_mut(&entry.client_id) else {
            return;
        };
        let Some(task) = job.tasks.get_mut(&entry.task_id) else {
            return;
        };
        let first = !task.state.is_terminal();
        task.state = state;
        if output.is_some() {
            task.output = output;
        }
        if timings.is_some() {
            task.timings = timings;
        }
        if first && task.variant.is_root() && job.pending_tasks > 0 {
            job.pending_tasks -= 1;
        }
    }
}

fn new_record(task_id: TaskId, variant: TaskVariant) -> TaskRecord {
    TaskRecord {
        id: task_id,
        state: TaskState::Pending,
        variant,
        assignments: Vec::new(),
        output: None,
        timings: None,
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn simple(input: &str) -> TaskVariant {
        TaskVariant::Simple {
            code: "word-count".to_string(),
            input: input.to_string(),
        }
    }

    fn entry(client: u64, task: u64) -> TaskRef {
        TaskRef {
            client_id: ClientId::from(client),
            task_id: TaskId::from(task),
        }
    }

    fn note(text: &str) -> ClientUpdate {
        ClientUpdate {
            note: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_pending_count_decrements_once_per_root() {
        let mut registry = ClientRegistry::new();
        let client = ClientId::from(1);
        registry.register_job(client, 2);
        registry.add_task(client, TaskId::from(1), simple("a"));
        registry.add_task(client, TaskId::from(2), simple("b"));

        registry.mark_done(entry(1, 1), TaskOutput::Value("out".to_string()), None);
        assert_eq!(registry.job(client).unwrap().pending_tasks, 1);
        assert!(!registry.all_tasks_complete(client));

        // A duplicate terminal transition must not decrement again.
        registry.mark_error(entry(1, 1), "late".to_string());
        assert_eq!(registry.job(client).unwrap().pending_tasks, 1);

        registry.mark_error(entry(1, 2), "boom".to_string());
        assert!(registry.all_tasks_complete(client));
    }

    #[test]
    fn test_sub_tasks_do_not_count_against_pending() {
        let mut registry = ClientRegistry::new();
        let client = ClientId::from(1);
        let root = TaskId::from(1);
        registry.register_job(client, 1);
        registry.add_task(
            client,
            root,
            TaskVariant::MapReduce {
                map_code: "m".to_string(),
                reduce_code: "r".to_string(),
                mode: ReduceMode::Aggregate,
                input: "s3://data/in".to_string(),
                num_mappers: 1,
                num_reducers: 1,
                children: Vec::new(),
            },
        );
        registry.add_sub_task(
            client,
            root,
            TaskId::from(2),
            TaskVariant::Mapper {
                parent: root,
                code: "m".to_string(),
                input: "s3://data/in".to_string(),
                index: 0,
                num_mappers: 1,
                num_reducers: 1,
            },
        );

        registry.mark_done(entry(1, 2), TaskOutput::Partitions(Vec::new()), None);
        assert_eq!(registry.job(client).unwrap().pending_tasks, 1);

        assert!(registry
            .sub_task(client, root, TaskId::from(2))
            .is_some());
        assert!(registry
            .sub_task(client, TaskId::from(9), TaskId::from(2))
            .is_none());
        match &registry.task(entry(1, 1)).unwrap().variant {
            TaskVariant::MapReduce { children, .. } => {
                assert_eq!(children, &vec![TaskId::from(2)])
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn test_updates_buffer_until_attach_then_flow_live() {
        let mut registry = ClientRegistry::new();
        let client = ClientId::from(1);
        registry.register_job(client, 1);

        registry.push_update(client, note("one"));
        registry.push_update(client, note("two"));

        let (sender, mut receiver) = mpsc::unbounded_channel();
        assert!(registry.attach_channel(client, sender, CancellationToken::new()));
        assert_eq!(receiver.try_recv().unwrap().unwrap().note, "one");
        assert_eq!(receiver.try_recv().unwrap().unwrap().note, "two");
        assert!(receiver.try_recv().is_err());

        registry.push_update(client, note("three"));
        assert_eq!(receiver.try_recv().unwrap().unwrap().note, "three");
    }

    #[test]
    fn test_attach_replaces_channel_and_cancels_old_guard() {
        let mut registry = ClientRegistry::new();
        let client = ClientId::from(1);
        registry.register_job(client, 1);

        let (first, mut first_rx) = mpsc::unbounded_channel();
        let first_guard = CancellationToken::new();
        registry.attach_channel(client, first, first_guard.clone());

        let (second, mut second_rx) = mpsc::unbounded_channel();
        registry.attach_channel(client, second, CancellationToken::new());
        assert!(first_guard.is_cancelled());

        registry.push_update(client, note("late"));
        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().unwrap().unwrap().note, "late");
    }

    #[test]
    fn test_dead_receiver_rebuffers_the_update() {
        let mut registry = ClientRegistry::new();
        let client = ClientId::from(1);
        registry.register_job(client, 1);

        let (sender, receiver) = mpsc::unbounded_channel();
        registry.attach_channel(client, sender, CancellationToken::new());
        drop(receiver);
        assert!(!registry.job(client).unwrap().channel_open());

        registry.push_update(client, note("kept"));
        assert!(!registry.job(client).unwrap().is_attached());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        registry.attach_channel(client, sender, CancellationToken::new());
        assert_eq!(receiver.try_recv().unwrap().unwrap().note, "kept");
    }

    #[test]
    fn test_revert_assignment_pops_only_the_failed_dispatch() {
        let mut registry = ClientRegistry::new();
        let client = ClientId::from(1);
        registry.register_job(client, 1);
        registry.add_task(client, TaskId::from(1), simple("a"));

        registry.mark_running(entry(1, 1), WorkerId::from(7));
        registry.mark_pending(entry(1, 1));
        registry.mark_running(entry(1, 1), WorkerId::from(8));
        assert_eq!(registry.task(entry(1, 1)).unwrap().assignments.len(), 2);

        registry.revert_assignment(entry(1, 1), WorkerId::from(8));
        let task = registry.task(entry(1, 1)).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.assignments.len(), 1);
        assert_eq!(task.assignments[0].worker, WorkerId::from(7));
    }
}
