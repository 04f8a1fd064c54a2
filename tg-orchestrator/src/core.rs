//! The gRPC surface. Handlers validate requests, translate them into
//! scheduler events, and wire the two streaming channels to the loop:
//! assignments flow out to workers, updates flow out to clients, and a
//! pump task per worker channel turns inbound reports into events.

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use common::{ClientId, TaskId, WorkerId};

use crate::client_registry::{JobKind, ObjectRef, ReduceMode, TaskOutput};
use crate::event::{EventSender, SchedulerEvent, TaskOutcome, WorkerReport};

pub use orchestrator::orchestrator_server::{Orchestrator, OrchestratorServer};

pub mod orchestrator {
    tonic::include_proto!("orchestrator");
}

use orchestrator::worker_message;

/// Sending half of a worker's assignment stream.
pub type AssignmentSink = mpsc::UnboundedSender<Result<orchestrator::TaskAssignment, Status>>;

/// Sending half of a client's result stream.
pub type UpdateSink = mpsc::UnboundedSender<Result<orchestrator::ClientUpdate, Status>>;

/// A job submission that passed validation.
#[derive(Debug)]
pub struct JobSubmission {
    pub kind: JobKind,
    pub code: Vec<String>,
    pub tasks: Vec<TaskSubmission>,
}

#[derive(Debug)]
pub struct TaskSubmission {
    pub input: String,
    pub num_mappers: u32,
    pub num_reducers: u32,
}

/// Check a submission before anything is recorded for it.
///
/// Aggregate jobs always run a single reducer, whatever the submission
/// asked for; everything else about the shape must be right or the
/// whole job is rejected.
pub fn validate_submission(
    request: orchestrator::SubmitJobRequest,
) -> Result<JobSubmission, Status> {
    let kind = orchestrator::JobKind::try_from(request.kind)
        .map_err(|_| Status::invalid_argument("unknown job kind"))?;
    if request.code.iter().any(|code| code.is_empty()) {
        return Err(Status::invalid_argument("code names must not be empty"));
    }
    let kind = match kind {
        orchestrator::JobKind::Simple => {
            if request.code.len() != 1 {
                return Err(Status::invalid_argument(
                    "simple jobs take exactly one code name",
                ));
            }
            JobKind::Simple
        }
        orchestrator::JobKind::Aggregate | orchestrator::JobKind::Partitioned => {
            if request.code.len() != 2 {
                return Err(Status::invalid_argument(
                    "map/reduce jobs take a map and a reduce code name",
                ));
            }
            let mode = if kind == orchestrator::JobKind::Aggregate {
                ReduceMode::Aggregate
            } else {
                ReduceMode::Partitioned
            };
            JobKind::MapReduce(mode)
        }
    };
    if request.tasks.is_empty() {
        return Err(Status::invalid_argument("a job needs at least one task"));
    }
    let mut tasks = Vec::with_capacity(request.tasks.len());
    for spec in request.tasks {
        let (num_mappers, num_reducers) = match kind {
            JobKind::Simple => (0, 0),
            JobKind::MapReduce(mode) => {
                if spec.num_mappers == 0 {
                    return Err(Status::invalid_argument(
                        "a map/reduce task needs at least one mapper",
                    ));
                }
                let num_reducers = match mode {
                    ReduceMode::Aggregate => 1,
                    ReduceMode::Partitioned => {
                        if spec.num_reducers == 0 {
                            return Err(Status::invalid_argument(
                                "a map/reduce task needs at least one reducer",
                            ));
                        }
                        spec.num_reducers
                    }
                };
                (spec.num_mappers, num_reducers)
            }
        };
        tasks.push(TaskSubmission {
            input: spec.input,
            num_mappers,
            num_reducers,
        });
    }
    Ok(JobSubmission {
        kind,
        code: request.code,
        tasks,
    })
}

/// The service handed to tonic. Owns nothing but the event queue; all
/// orchestrator state lives with the scheduler loop.
#[derive(Clone)]
pub struct OrchestratorService {
    events: EventSender,
}

impl OrchestratorService {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    fn send(&self, event: SchedulerEvent) -> Result<(), Status> {
        self.events
            .send(event)
            .map_err(|_| Status::unavailable("scheduler is shutting down"))
    }
}

#[tonic::async_trait]
impl Orchestrator for OrchestratorService {
    async fn register_worker(
        &self,
        request: Request<orchestrator::RegisterWorkerRequest>,
    ) -> Result<Response<orchestrator::RegisterWorkerResponse>, Status> {
        let request = request.into_inner();
        if request.slots == 0 {
            return Err(Status::invalid_argument("a worker needs at least one slot"));
        }
        let (reply, answer) = oneshot::channel();
        self.send(SchedulerEvent::RegisterWorker {
            slots: request.slots,
            reply,
        })?;
        let worker_id = answer
            .await
            .map_err(|_| Status::unavailable("scheduler dropped the request"))?;
        Ok(Response::new(orchestrator::RegisterWorkerResponse {
            worker_id: worker_id.into(),
        }))
    }

    async fn submit_job(
        &self,
        request: Request<orchestrator::SubmitJobRequest>,
    ) -> Result<Response<orchestrator::SubmitJobResponse>, Status> {
        let submission = validate_submission(request.into_inner())?;
        let (reply, answer) = oneshot::channel();
        self.send(SchedulerEvent::SubmitJob { submission, reply })?;
        let client_id = answer
            .await
            .map_err(|_| Status::unavailable("scheduler dropped the request"))?;
        Ok(Response::new(orchestrator::SubmitJobResponse {
            client_id: client_id.into(),
        }))
    }

    type WorkerChannelStream = UnboundedReceiverStream<Result<orchestrator::TaskAssignment, Status>>;

    async fn worker_channel(
        &self,
        request: Request<Streaming<orchestrator::WorkerMessage>>,
    ) -> Result<Response<Self::WorkerChannelStream>, Status> {
        let mut inbound = request.into_inner();
        let hello = match inbound.message().await? {
            Some(orchestrator::WorkerMessage {
                message: Some(worker_message::Message::Hello(hello)),
            }) => hello,
            Some(_) => {
                return Err(Status::invalid_argument(
                    "the first worker message must be a hello",
                ));
            }
            None => {
                return Err(Status::invalid_argument(
                    "worker channel closed before hello",
                ));
            }
        };
        let worker_id = WorkerId::from(hello.worker_id);

        let (sender, receiver) = mpsc::unbounded_channel();
        let (reply, answer) = oneshot::channel();
        self.send(SchedulerEvent::WorkerChannelOpened {
            worker_id,
            sender,
            reply,
        })?;
        answer
            .await
            .map_err(|_| Status::unavailable("scheduler dropped the request"))??;

        // Pump inbound reports into the scheduler until the worker hangs
        // up or the stream errors.
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => {
                        if let Some(report) = decode_report(worker_id, message) {
                            if events.send(SchedulerEvent::TaskReported { report }).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        debug!("worker {} channel error: {}", worker_id, status);
                        break;
                    }
                }
            }
            let _ = events.send(SchedulerEvent::WorkerDisconnected { worker_id });
        });

        Ok(Response::new(UnboundedReceiverStream::new(receiver)))
    }

    type ClientChannelStream = UnboundedReceiverStream<Result<orchestrator::ClientUpdate, Status>>;

    async fn client_channel(
        &self,
        request: Request<orchestrator::ClientChannelRequest>,
    ) -> Result<Response<Self::ClientChannelStream>, Status> {
        let client_id = ClientId::from(request.into_inner().client_id);

        let (sender, receiver) = mpsc::unbounded_channel();
        let guard = CancellationToken::new();
        let (reply, answer) = oneshot::channel();
        self.send(SchedulerEvent::ClientChannelOpened {
            client_id,
            sender: sender.clone(),
            guard: guard.clone(),
            reply,
        })?;
        answer
            .await
            .map_err(|_| Status::unavailable("scheduler dropped the request"))??;

        // Watch for the client dropping its stream. The guard is
        // cancelled instead when the orchestrator closes the channel, so
        // an orderly close never reads as a disconnect.
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sender.closed() => {
                    let _ = events.send(SchedulerEvent::ClientDisconnected { client_id });
                }
                _ = guard.cancelled() => {}
            }
        });

        Ok(Response::new(UnboundedReceiverStream::new(receiver)))
    }
}

/// Turn a wire report into a scheduler event payload. Done reports with
/// output references are mapper reports; done reports without are a
/// simple task's or reducer's single value.
fn decode_report(
    worker_id: WorkerId,
    message: orchestrator::WorkerMessage,
) -> Option<WorkerReport> {
    let report = match message.message {
        Some(worker_message::Message::Report(report)) => report,
        Some(worker_message::Message::Hello(_)) => {
            warn!("worker {} sent a second hello, ignoring", worker_id);
            return None;
        }
        None => return None,
    };
    let status = orchestrator::TaskStatus::try_from(report.status)
        .unwrap_or(orchestrator::TaskStatus::Error);
    let outcome = match status {
        orchestrator::TaskStatus::Done if report.outputs.is_empty() => {
            TaskOutcome::Done(TaskOutput::Value(report.value))
        }
        orchestrator::TaskStatus::Done => TaskOutcome::Done(TaskOutput::Partitions(
            report
                .outputs
                .into_iter()
                .map(|reference| ObjectRef {
                    partition: reference.partition,
                    url: reference.url,
                })
                .collect(),
        )),
        orchestrator::TaskStatus::Error => TaskOutcome::Error(report.error),
    };
    Some(WorkerReport {
        worker_id,
        client_id: ClientId::from(report.client_id),
        task_id: TaskId::from(report.task_id),
        outcome,
        timings: report.timings,
    })
}
