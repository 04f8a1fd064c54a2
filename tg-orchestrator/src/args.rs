use clap::Parser;

/// Command line arguments for the orchestrator.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The port for the server to run on.
    #[arg(short, long, default_value = "8130")]
    pub port: u16,
}
