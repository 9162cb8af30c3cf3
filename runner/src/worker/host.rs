use super::{classify::StepOutput, plan::StepSpec, WorkerFailure};
use crate::command::run_with_input;
use once_cell::sync::Lazy;
use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

/// site the job landed on, as announced by the grid middleware
static SITE: Lazy<Option<String>> = Lazy::new(|| env::var("DIRACSITE").ok());

static JOB_ID: Lazy<Option<String>> = Lazy::new(|| env::var("DIRACJOBID").ok());

/// seeds stay clear of the top of the generator's 32 bit range
const SEED_LIMIT: u64 = (1 << 32) - 10;

const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the worker touches outside its own logic
pub trait WorkerHost {
    fn site(&self) -> Option<String>;

    fn mount_available(&self, path: &Path) -> bool;

    /// read a file of the job directory
    fn read_file(&self, name: &str) -> Result<String, WorkerFailure>;

    /// replace a file of the job directory
    fn write_file(&self, name: &str, contents: &str) -> Result<(), WorkerFailure>;

    /// write the step script, run it and hand back its exit code and log
    fn run_step(&self, step: &StepSpec, software_init: &str) -> Result<StepOutput, WorkerFailure>;

    fn sleep(&self, duration: Duration);

    fn report_status(&self, message: &str);

    /// uniform in `[0, 2^32 - 10)`
    fn random_seed(&self) -> u64;

    /// uniform in `[0, 1)`
    fn random_fraction(&self) -> f64;
}

/// The compute node the job runs on
#[derive(Debug, Clone)]
pub struct LocalHost {
    workdir: PathBuf,
    status_exec: Option<PathBuf>,
}

impl LocalHost {
    pub fn new(workdir: &Path, status_exec: Option<PathBuf>) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            status_exec,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }
}

impl WorkerHost for LocalHost {
    fn site(&self) -> Option<String> {
        SITE.clone()
    }

    fn mount_available(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_file(&self, name: &str) -> Result<String, WorkerFailure> {
        fs::read_to_string(self.path(name))
            .map_err(|error| WorkerFailure::Setup(format!("reading {name}: {error}")))
    }

    fn write_file(&self, name: &str, contents: &str) -> Result<(), WorkerFailure> {
        fs::write(self.path(name), contents)
            .map_err(|error| WorkerFailure::Setup(format!("writing {name}: {error}")))
    }

    fn run_step(&self, step: &StepSpec, software_init: &str) -> Result<StepOutput, WorkerFailure> {
        self.write_file(&step.script, &step.script_text(software_init))?;

        debug!(script = %step.script, "Running step");
        let status = Command::new("/bin/bash")
            .arg(&step.script)
            .current_dir(&self.workdir)
            .status()
            .map_err(|error| WorkerFailure::Setup(format!("running {}: {error}", step.script)))?;

        let log = match fs::read(self.path(&step.log)) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(error) => {
                warn!(log = %step.log, error = %error, "Step left no log");
                String::new()
            }
        };

        Ok(StepOutput {
            exit_code: status.code().unwrap_or(-1),
            log,
        })
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }

    fn report_status(&self, message: &str) {
        info!(status = message, "Application status");

        let (Some(exec), Some(job_id)) = (&self.status_exec, JOB_ID.as_deref()) else {
            return;
        };

        if let Err(error) = run_with_input(exec, [job_id, message], "", STATUS_TIMEOUT) {
            warn!(error = %error, "Could not report application status");
        }
    }

    fn random_seed(&self) -> u64 {
        fastrand::u64(..SEED_LIMIT)
    }

    fn random_fraction(&self) -> f64 {
        fastrand::f64()
    }
}
