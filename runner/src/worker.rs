pub mod classify;
pub mod host;
pub mod plan;
pub mod procedure;
pub mod synth;

use self::{host::LocalHost, plan::WorkerPlan, procedure::WorkerProcedure};
use crate::{
    catalog::{CatalogRegistrar, Catalogs},
    templates::TemplateError,
};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{error, info};

/// Written next to the job after the worker finished, shipped back in the output sandbox
pub const STATUS_FILE: &str = "status.yaml";

/// Terminal failures of one batch, each with its own exit code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    #[error("cvmfs not found")]
    MountMissing,
    #[error("DB connection failed")]
    DatabaseUnavailable,
    #[error("Too many substeps")]
    ConvergenceFailure,
    #[error("No events in stdhep")]
    InputExhausted,
    #[error("Simulation Error")]
    SimulationGeneric,
    #[error("Reconstruction Error")]
    ValidationFailure,
    #[error("Worker setup failed: {0}")]
    Setup(String),
}

impl WorkerFailure {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::MountMissing => ExitCode::MountMissing,
            Self::DatabaseUnavailable => ExitCode::DatabaseUnavailable,
            Self::ConvergenceFailure => ExitCode::ConvergenceFailure,
            Self::InputExhausted => ExitCode::InputExhausted,
            Self::SimulationGeneric => ExitCode::SimulationGeneric,
            Self::ValidationFailure => ExitCode::ValidationFailure,
            Self::Setup(_) => ExitCode::Setup,
        }
    }
}

impl From<TemplateError> for WorkerFailure {
    fn from(error: TemplateError) -> Self {
        Self::Setup(error.to_string())
    }
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    Setup = 1,
    MountMissing = 11,
    SimulationGeneric = 20,
    DatabaseUnavailable = 21,
    ConvergenceFailure = 22,
    InputExhausted = 23,
    ValidationFailure = 30,
}

/// Final word of a worker, as stored in `status.yaml`
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct WorkerReport {
    pub job_name: String,
    pub code: ExitCode,
    pub message: String,
}

impl WorkerReport {
    pub fn new(job_name: &str, outcome: &Result<(), WorkerFailure>) -> Self {
        let (code, message) = match outcome {
            Ok(()) => (ExitCode::Success, "Done".to_string()),
            Err(failure) => (failure.exit_code(), failure.to_string()),
        };

        Self {
            job_name: job_name.to_string(),
            code,
            message,
        }
    }
}

/// Entry point of `dsub worker`: run the plan in the current directory and
/// return the process exit code.
#[tracing::instrument(level = "info")]
pub fn execute(plan_path: &Path) -> ExitCode {
    let plan = match load_plan(plan_path) {
        Ok(plan) => plan,
        Err(failure) => {
            error!(error = %failure, "Could not load worker plan");
            return failure.exit_code();
        }
    };

    let workdir = plan_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let host = LocalHost::new(workdir, plan.status_exec.clone());
    let registrar = CatalogRegistrar::new(Catalogs::load(&plan.catalog), plan.catalog_retry.clone());

    let outcome = WorkerProcedure::new(&plan, &host, registrar).run();
    let report = WorkerReport::new(&plan.job_name, &outcome);

    match serde_yaml::to_string(&report) {
        Ok(text) => {
            if let Err(error) = fs::write(workdir.join(STATUS_FILE), text) {
                error!(error = %error, "Could not write {STATUS_FILE}");
            }
        }
        Err(error) => error!(error = %error, "Could not serialize worker report"),
    }

    info!(code = ?report.code, message = %report.message, "Worker finished");
    report.code
}

fn load_plan(path: &Path) -> Result<WorkerPlan, WorkerFailure> {
    let text = fs::read_to_string(path)
        .map_err(|error| WorkerFailure::Setup(format!("{}: {error}", path.display())))?;

    serde_yaml::from_str(&text)
        .map_err(|error| WorkerFailure::Setup(format!("{}: {error}", path.display())))
}
