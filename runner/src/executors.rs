pub mod dry_run;
pub mod exec;

use crate::{command::CommandError, config::SubmitterConfig, job::JobDescriptor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Job {name} was rejected: {message}")]
    Rejected { name: String, message: String },
    #[error("Submission command failed")]
    Command(#[from] CommandError),
    #[error("Job descriptor could not be serialized")]
    Serialize(#[from] serde_yaml::Error),
}

/// Accepted job, as identified by the submission system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: String,
}

/// Hands a finished job descriptor to the submission system
pub trait Submitter {
    fn submit(&self, job: &JobDescriptor) -> Result<Submission, SubmitError>;
}

/// All submission backends, selected by `submitter` in the job config
#[derive(Debug)]
pub enum Executors {
    DryRun(dry_run::DryRunExecutor),
    Exec(exec::ExecExecutor),
}

impl Executors {
    pub fn load(config: &SubmitterConfig) -> Self {
        match config {
            SubmitterConfig::DryRun => Self::DryRun(dry_run::DryRunExecutor::default()),
            SubmitterConfig::Exec { exec, timeout_ms } => {
                Self::Exec(exec::ExecExecutor::new(exec.clone(), *timeout_ms))
            }
        }
    }
}

impl Submitter for Executors {
    fn submit(&self, job: &JobDescriptor) -> Result<Submission, SubmitError> {
        match self {
            Self::DryRun(executor) => executor.submit(job),
            Self::Exec(executor) => executor.submit(job),
        }
    }
}
