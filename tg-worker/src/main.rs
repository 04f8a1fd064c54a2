//! The worker binary. Registers with the orchestrator, opens the duplex
//! task channel and executes whatever arrives, up to its slot count at
//! once.

mod args;
mod core;
mod engine;

use clap::Parser;
use tracing::info;

use common::minio::{self, ClientConfig};

use crate::args::Args;
use crate::engine::ExecutionContext;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let storage = minio::Client::from_conf(ClientConfig {
        access_key_id: args.access_key_id.clone(),
        secret_access_key: args.secret_access_key.clone(),
        region: args.region.clone(),
        url: args.endpoint.clone(),
    });
    let root = minio::path_to_bucket_key(&args.storage)?;
    storage.ensure_bucket(&root.bucket).await?;
    info!("task output goes to {}", args.storage);

    let context = ExecutionContext::new(storage, root);
    core::run(&args.address, args.slots, context).await?;
    Ok(())
}
