//! The orchestrator binary. Serves the gRPC surface and runs the
//! scheduler loop beside it until interrupted.

mod args;
mod client_registry;
mod core;
mod dispatcher;
mod event;
mod handlers;
mod map_reduce;
mod scheduler;
mod task_queue;
mod worker_registry;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tonic::transport::Server;
use tracing::info;

use crate::args::Args;
use crate::core::{OrchestratorServer, OrchestratorService};
use crate::event::SchedulerEvent;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let addr = format!("[::1]:{}", args.port).parse()?;
    info!("orchestrator listening on {}", addr);

    let (events, receiver) = mpsc::unbounded_channel();
    let tracker = TaskTracker::new();
    tracker.spawn(scheduler::run(receiver));

    let service = OrchestratorService::new(events.clone());
    Server::builder()
        .add_service(OrchestratorServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    let _ = events.send(SchedulerEvent::Shutdown);
    tracker.close();
    tracker.wait().await;
    Ok(())
}
