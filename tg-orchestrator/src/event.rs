//! Messages processed by the scheduler loop.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use common::{ClientId, TaskId, WorkerId};

use crate::client_registry::TaskOutput;
use crate::core::orchestrator::TaskTimings;
use crate::core::{AssignmentSink, JobSubmission, UpdateSink};

/// Sending half of the scheduler's event queue.
pub type EventSender = mpsc::UnboundedSender<SchedulerEvent>;

/// Everything the scheduler reacts to. RPC handlers translate requests
/// into events; the `reply` channels carry back the synchronous part of
/// an answer where the protocol needs one.
pub enum SchedulerEvent {
    SubmitJob {
        submission: JobSubmission,
        reply: oneshot::Sender<ClientId>,
    },
    RegisterWorker {
        slots: u32,
        reply: oneshot::Sender<WorkerId>,
    },
    WorkerChannelOpened {
        worker_id: WorkerId,
        sender: AssignmentSink,
        reply: oneshot::Sender<Result<(), Status>>,
    },
    WorkerDisconnected {
        worker_id: WorkerId,
    },
    TaskReported {
        report: WorkerReport,
    },
    ClientChannelOpened {
        client_id: ClientId,
        sender: UpdateSink,
        guard: CancellationToken,
        reply: oneshot::Sender<Result<(), Status>>,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
    Shutdown,
}

/// A task report decoded off a worker channel.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    pub client_id: ClientId,
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub timings: Option<TaskTimings>,
}

/// Terminal outcome carried by a report.
#[derive(Debug)]
pub enum TaskOutcome {
    Done(TaskOutput),
    Error(String),
}
