//! Quarry command line front end.
//!
//! Submits query jobs, manages their result tables and runs the worker that
//! executes queued tasks. Every command opens the job store named by the
//! configuration file and acts for the user given with `--user` (anonymous
//! otherwise).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use quarry_jobs::JobError;
use quarry_logging::{init_logging, LogConfig};

mod cli;

use cli::context::GlobalArgs;

#[derive(Parser, Debug)]
#[command(name = "quarry", version, about = "Query jobs against a result database")]
struct Cli {
    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "QUARRY_CONFIG")]
    config: Option<PathBuf>,

    /// Act as this user (anonymous when omitted)
    #[arg(long, global = true, env = "QUARRY_USER")]
    user: Option<String>,

    /// Groups of the user (repeatable)
    #[arg(long = "group", global = true)]
    groups: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a query job
    Submit(cli::jobs::SubmitArgs),

    /// Upload a CSV file into a new table
    Upload(cli::jobs::UploadArgs),

    /// Show a job
    Status {
        /// Job ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List jobs of the user, newest first
    List {
        /// Maximum jobs to display
        #[arg(long, default_value = "50")]
        limit: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Abort a queued or executing job
    Abort {
        /// Job ID
        id: String,
    },

    /// Drop the result table of a job and keep its record
    Archive {
        /// Job ID
        id: String,
    },

    /// Delete a job, its result table and its download files
    Delete {
        /// Job ID
        id: String,
    },

    /// Rename the result table of a job
    Rename {
        /// Job ID
        id: String,
        /// New table name
        table: String,
    },

    /// Show a page of result rows
    Rows(cli::results::RowsArgs),

    /// Stream a result in a download format
    Stream(cli::results::StreamArgs),

    /// Write a result file in a download format
    Download(cli::results::DownloadArgs),

    /// Bundle the files referenced by a result column into a zip archive
    #[command(name = "archive-files")]
    ArchiveFiles(cli::results::ArchiveFilesArgs),

    /// Run a worker for queued tasks
    Worker(cli::worker::WorkerArgs),

    /// List the example queries available to the user
    Examples {
        #[arg(long)]
        json: bool,
    },

    /// List queues, query languages and download formats
    Queues {
        #[arg(long)]
        json: bool,
    },

    /// Show the latest query usage records
    Records {
        #[arg(long, default_value = "50")]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
}

fn run_command(global: &GlobalArgs, command: Commands) -> Result<()> {
    match command {
        Commands::Submit(args) => cli::jobs::submit(global, args),
        Commands::Upload(args) => cli::jobs::upload(global, args),
        Commands::Status { id, json } => cli::jobs::status(global, &id, json),
        Commands::List { limit, json } => cli::jobs::list(global, limit, json),
        Commands::Abort { id } => cli::jobs::abort(global, &id),
        Commands::Archive { id } => cli::jobs::archive(global, &id),
        Commands::Delete { id } => cli::jobs::delete(global, &id),
        Commands::Rename { id, table } => cli::jobs::rename(global, &id, &table),
        Commands::Rows(args) => cli::results::rows(global, args),
        Commands::Stream(args) => cli::results::stream(global, args),
        Commands::Download(args) => cli::results::download(global, args),
        Commands::ArchiveFiles(args) => cli::results::archive_files(global, args),
        Commands::Worker(args) => cli::worker::run(global, args),
        Commands::Examples { json } => cli::jobs::examples(global, json),
        Commands::Queues { json } => cli::jobs::queues(global, json),
        Commands::Records { limit, json } => cli::jobs::records(global, limit, json),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logging(LogConfig {
        app_name: "quarry",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("Warning: failed to initialize logging: {:?}", err);
            None
        }
    };

    let global = GlobalArgs {
        config: cli.config,
        user: cli.user,
        groups: cli.groups,
    };

    match run_command(&global, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err
                .downcast_ref::<JobError>()
                .and_then(JobError::validation_errors)
            {
                Some(errors) => cli::output::print_validation_errors(errors),
                None => eprintln!("Error: {:?}", err),
            }
            ExitCode::from(1)
        }
    }
}
