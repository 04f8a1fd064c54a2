mod args;
use args::{parse_args, Commands, JobShape};

mod core;
use crate::core::orchestrator::JobKind;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (address, command) = parse_args();

    match command {
        Commands::Submit {
            workload,
            reducer,
            kind,
            num_mappers,
            num_reducers,
            inputs,
        } => {
            let kind = match kind {
                JobShape::Simple => JobKind::Simple,
                JobShape::Aggregate => JobKind::Aggregate,
                JobShape::Partitioned => JobKind::Partitioned,
            };
            let code = match reducer {
                Some(reducer) => vec![workload, reducer],
                None => vec![workload],
            };
            core::submit(address, kind, code, inputs, num_mappers, num_reducers).await?;
        }
        Commands::Results { client_id } => core::results(address, client_id).await?,
    }

    Ok(())
}
