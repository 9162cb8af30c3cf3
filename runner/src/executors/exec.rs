use super::{SubmitError, Submission, Submitter};
use crate::{command::run_with_input, job::JobDescriptor};
use std::{path::PathBuf, time::Duration};
use tracing::debug;

/// Submits through an external command: `<exec> submit` reads the job
/// descriptor as YAML on stdin and prints the job id.
#[derive(Debug, Clone)]
pub struct ExecExecutor {
    exec: PathBuf,
    timeout: Duration,
}

impl ExecExecutor {
    pub fn new(exec: PathBuf, timeout_ms: u64) -> Self {
        Self {
            exec,
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl Submitter for ExecExecutor {
    fn submit(&self, job: &JobDescriptor) -> Result<Submission, SubmitError> {
        let descriptor = serde_yaml::to_string(job)?;
        let output = run_with_input(&self.exec, ["submit"], &descriptor, self.timeout)?;
        debug!("Output from submission command: {output}");

        match output.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(id) => Ok(Submission { id: id.to_string() }),
            None => Err(SubmitError::Rejected {
                name: job.name.clone(),
                message: "submission command printed no job id".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};

    fn job() -> JobDescriptor {
        JobDescriptor {
            name: "CEPC_v1_(0.1)_zh".to_string(),
            group: "yant_150615_zh".to_string(),
            executable: "job.sh".to_string(),
            executable_log: "script.log".to_string(),
            input_sandbox: vec![],
            output_sandbox: vec![],
            output_data: vec![],
            storage_element: "IHEP-STORM".to_string(),
            sites: vec!["CLUSTER.WHU.cn".to_string()],
            cpu_time: 86400,
        }
    }

    #[test]
    fn pipes_descriptor_and_reads_id() {
        let dir = tempfile::tempdir().unwrap();
        let exec = dir.path().join("submit.sh");
        let captured = dir.path().join("job.yaml");
        fs::write(
            &exec,
            format!("#!/bin/sh\ncat > {}\necho 4711\n", captured.display()),
        )
        .unwrap();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o755)).unwrap();

        let submission = ExecExecutor::new(exec, 5_000).submit(&job()).unwrap();

        assert_eq!(submission.id, "4711");
        let sent: JobDescriptor =
            serde_yaml::from_str(&fs::read_to_string(captured).unwrap()).unwrap();
        assert_eq!(sent, job());
    }

    #[test]
    fn empty_output_is_a_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let exec = dir.path().join("submit.sh");
        fs::write(&exec, "#!/bin/sh\ncat > /dev/null\n").unwrap();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(
            ExecExecutor::new(exec, 5_000).submit(&job()),
            Err(SubmitError::Rejected { .. })
        ));
    }
}
