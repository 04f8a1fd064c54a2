//! The scheduling loop. One task owns every piece of orchestrator
//! state; the gRPC handlers talk to it exclusively through events, so
//! nothing here needs a lock.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::info;

use common::{ClientId, IdGenerator, TaskId, WorkerId};

use crate::client_registry::ClientRegistry;
use crate::event::SchedulerEvent;
use crate::map_reduce::MapReduceCoordinator;
use crate::task_queue::TaskQueue;
use crate::worker_registry::WorkerRegistry;

pub struct Scheduler {
    pub(crate) workers: WorkerRegistry,
    pub(crate) queue: TaskQueue,
    pub(crate) clients: ClientRegistry,
    pub(crate) stages: MapReduceCoordinator,
    /// Workers that registered but have not opened their channel yet,
    /// with the slot count they announced.
    pub(crate) pending_workers: HashMap<WorkerId, u32>,
    pub(crate) worker_ids: IdGenerator<WorkerId>,
    pub(crate) client_ids: IdGenerator<ClientId>,
    pub(crate) task_ids: IdGenerator<TaskId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            workers: WorkerRegistry::new(),
            queue: TaskQueue::new(),
            clients: ClientRegistry::new(),
            stages: MapReduceCoordinator::new(),
            pending_workers: HashMap::new(),
            worker_ids: IdGenerator::new(),
            client_ids: IdGenerator::new(),
            task_ids: IdGenerator::new(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the scheduler until its event queue closes or a shutdown event
/// arrives.
pub async fn run(mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
    let mut scheduler = Scheduler::new();
    info!("scheduler loop started");
    while let Some(event) = events.recv().await {
        if !scheduler.handle(event) {
            break;
        }
    }
    info!("scheduler loop stopped");
}
