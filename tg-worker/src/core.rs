//! The worker's connection to the orchestrator: register, open the
//! duplex channel, execute assignments concurrently and stream reports
//! back over the same connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};

use crate::engine::ExecutionContext;

pub use orchestrator::orchestrator_client::OrchestratorClient;
pub mod orchestrator {
    tonic::include_proto!("orchestrator");
}

use orchestrator::worker_message::Message;
use orchestrator::{RegisterWorkerRequest, WorkerHello, WorkerMessage};

pub async fn run(address: &str, slots: u32, context: ExecutionContext) -> Result<()> {
    let mut client = OrchestratorClient::connect(address.to_string()).await?;

    let response = client
        .register_worker(RegisterWorkerRequest { slots })
        .await?
        .into_inner();
    let worker_id = response.worker_id;
    info!("registered with the orchestrator as worker {}", worker_id);

    // The channel opens with a hello naming the registered id; only then
    // does the orchestrator start assigning.
    let (sender, receiver) = mpsc::unbounded_channel();
    sender.send(WorkerMessage {
        message: Some(Message::Hello(WorkerHello { worker_id })),
    })?;
    let outbound = UnboundedReceiverStream::new(receiver);
    let mut assignments = client.worker_channel(outbound).await?.into_inner();

    let limiter = Arc::new(Semaphore::new(slots as usize));
    let context = Arc::new(context);

    loop {
        tokio::select! {
            assignment = assignments.message() => {
                match assignment {
                    Ok(Some(assignment)) => {
                        let permit = limiter.clone().acquire_owned().await?;
                        let context = context.clone();
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            let report = context.execute(assignment).await;
                            let _ = sender.send(WorkerMessage {
                                message: Some(Message::Report(report)),
                            });
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        warn!("the orchestrator closed the channel");
                        break;
                    }
                    Err(status) => {
                        error!("assignment stream failed: {}", status);
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutting down, waiting for running tasks");
                break;
            }
        }
    }

    // Wait until every running task has handed in its report, then give
    // the transport a moment to flush before the stream drops.
    let _ = limiter.acquire_many(slots).await?;
    drop(sender);
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
