use clap::{command, Parser, Subcommand, ValueEnum};

//
// For parsing the user specified command.
//
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The address of the orchestrator.
    #[arg(short, long, default_value = "http://[::1]:8130")]
    pub connect: String,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a job and stream its results.
    Submit {
        /// Name of the workload, or of the map workload for two-stage
        /// jobs.
        #[arg(short, long)]
        workload: String,

        /// Name of the reduce workload for two-stage jobs.
        #[arg(short, long)]
        reducer: Option<String>,

        /// The job shape to run.
        #[arg(short, long, value_enum, default_value = "simple")]
        kind: JobShape,

        /// Mappers per task for two-stage jobs.
        #[arg(short = 'm', long, default_value = "4")]
        num_mappers: u32,

        /// Reducers per task for two-stage jobs.
        #[arg(short = 'n', long, default_value = "1")]
        num_reducers: u32,

        /// One storage URL or argument per task.
        #[clap(value_parser, last = true)]
        inputs: Vec<String>,
    },
    /// Re-open the result stream for an accepted job.
    Results {
        /// The client id returned at submission.
        client_id: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum JobShape {
    /// One code unit run whole, one task per input.
    Simple,
    /// Two stages; a single reducer consumes all mapper output.
    Aggregate,
    /// Two stages; reducers consume hash partitions of mapper output.
    Partitioned,
}

/// Parse the user command.
pub fn parse_args() -> (String, Commands) {
    let args = Args::parse();
    (args.connect, args.command)
}
