use tonic::transport::Channel;

//
// Import gRPC stubs/definitions.
//
use orchestrator::orchestrator_client::OrchestratorClient;
use orchestrator::{
    ClientChannelRequest, ClientUpdate, JobKind, SubmitJobRequest, TaskSpec, TaskStatus,
    TaskTimings, UpdateKind,
};

pub mod orchestrator {
    tonic::include_proto!("orchestrator");
}

/// Submit a job, then stay on the result stream until the orchestrator
/// closes it.
pub async fn submit(
    address: String,
    kind: JobKind,
    code: Vec<String>,
    inputs: Vec<String>,
    num_mappers: u32,
    num_reducers: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = OrchestratorClient::connect(address).await?;

    let tasks = inputs
        .into_iter()
        .map(|input| TaskSpec {
            input,
            num_mappers,
            num_reducers,
        })
        .collect();
    let request = tonic::Request::new(SubmitJobRequest {
        code,
        tasks,
        kind: kind as i32,
    });
    let response = client.submit_job(request).await?;
    let client_id = response.into_inner().client_id;
    println!("job accepted, client id {client_id}");

    follow(&mut client, client_id).await
}

/// Re-open the result stream for a job submitted earlier. Updates that
/// arrived in the meantime are replayed first.
pub async fn results(address: String, client_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = OrchestratorClient::connect(address).await?;
    follow(&mut client, client_id).await
}

async fn follow(
    client: &mut OrchestratorClient<Channel>,
    client_id: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = tonic::Request::new(ClientChannelRequest { client_id });
    let mut updates = client.client_channel(request).await?.into_inner();

    while let Some(update) = updates.message().await? {
        print_update(update);
    }
    Ok(())
}

fn print_update(update: ClientUpdate) {
    let kind = UpdateKind::try_from(update.kind).unwrap_or(UpdateKind::Info);
    match kind {
        UpdateKind::TaskResult => {
            if update.status == TaskStatus::Error as i32 {
                println!("task {} failed: {}", update.task_id, update.error);
            } else {
                println!("task {} done", update.task_id);
                for result in &update.results {
                    println!("  {result}");
                }
            }
            print_timings(update.timings.as_ref());
        }
        UpdateKind::Info => {
            if update.note.is_empty() {
                return;
            }
            if update.task_id != 0 {
                println!("task {}: {}", update.task_id, update.note);
            } else {
                println!("{}", update.note);
            }
            print_timings(update.timings.as_ref());
        }
        UpdateKind::Error => {
            println!("task {} aborted: {}", update.task_id, update.error);
        }
    }
}

fn print_timings(timings: Option<&TaskTimings>) {
    if let Some(timings) = timings {
        println!(
            "  read {:.3}s, exec {:.3}s, write {:.3}s, total {:.3}s",
            timings.read_secs,
            timings.exec_secs,
            timings.write_secs,
            timings.finished_at - timings.started_at
        );
    }
}
