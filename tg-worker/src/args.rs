use clap::Parser;

/// Command line arguments for a worker.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The address of the orchestrator.
    #[arg(short = 'j', long = "join", default_value = "http://[::1]:8130")]
    pub address: String,

    /// How many tasks to run concurrently.
    #[arg(short, long, default_value = "4")]
    pub slots: u32,

    /// Access key for the object store.
    #[arg(long, default_value = "minioadmin")]
    pub access_key_id: String,

    /// Secret key for the object store.
    #[arg(long, default_value = "minioadmin")]
    pub secret_access_key: String,

    /// Region of the object store.
    #[arg(long, default_value = "us-east-1")]
    pub region: String,

    /// Endpoint of the object store.
    #[arg(long, default_value = "http://127.0.0.1:9000")]
    pub endpoint: String,

    /// Storage root for intermediate and final task output.
    #[arg(long, default_value = "s3://taskgrid")]
    pub storage: String,
}
