use chrono::Local;
use clap::{Parser, Subcommand};
use dsub::{
    catalog::{CatalogRegistrar, Catalogs},
    config::{CatalogConfig, Identity, RunParameters, SubmitterConfig, UserConfig},
    executors::Executors,
    pipeline::{split_and_submit, PlanError, RunSummary},
    retry::RetryPolicy,
    worker,
};
use std::{env, path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dsub", version, about = "Split CEPC simulation and reconstruction into grid jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan all batches of a job config and submit them
    Submit {
        /// `key = value` job config
        config: PathBuf,

        /// submitting user, defaults to $DIRAC_USER
        #[arg(short, long)]
        user: Option<String>,

        /// write every unit but neither submit nor touch the real catalog
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one planned batch on the compute node
    Worker {
        /// worker plan written by `submit`
        plan: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            config,
            user,
            dry_run,
        } => match submit(config, user, dry_run) {
            Ok(summary) if summary.jobs_submitted == summary.jobs_total => exit(0),
            Ok(_) => exit(2),
            Err(error) => {
                error!(error = ?error, "{error}");
                exit(1)
            }
        },
        Commands::Worker { plan } => exit(worker::execute(&plan) as i32),
    }
}

fn submit(config: PathBuf, user: Option<String>, dry_run: bool) -> Result<RunSummary, PlanError> {
    let username = user.or_else(|| env::var("DIRAC_USER").ok());
    let identity = Identity::new(username.unwrap_or_default())?;
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let current_exe = env::current_exe().unwrap_or_else(|_| PathBuf::from("dsub"));

    let mut params = RunParameters::resolve(
        UserConfig::load(&config)?,
        identity,
        &cwd,
        Local::now().naive_local(),
        &current_exe,
    )?;

    if dry_run {
        params.submitter = SubmitterConfig::DryRun;
        params.catalog = CatalogConfig::Memory;
    }

    let submitter = Executors::load(&params.submitter);
    let registrar = CatalogRegistrar::new(Catalogs::load(&params.catalog), RetryPolicy::catalog());

    split_and_submit(&params, &submitter, &registrar)
}
