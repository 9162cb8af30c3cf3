use super::{SubmitError, Submission, Submitter};
use crate::job::JobDescriptor;
use parking_lot::Mutex;
use tracing::info;

/// Records jobs instead of submitting them
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    submitted: Mutex<Vec<JobDescriptor>>,
}

impl DryRunExecutor {
    /// every job seen so far, in submission order
    pub fn submitted(&self) -> Vec<JobDescriptor> {
        self.submitted.lock().clone()
    }
}

impl Submitter for DryRunExecutor {
    fn submit(&self, job: &JobDescriptor) -> Result<Submission, SubmitError> {
        let mut submitted = self.submitted.lock();
        submitted.push(job.clone());

        info!(
            name = %job.name,
            sites = ?job.sites,
            outputs = ?job.output_data,
            "Dry run, job not submitted"
        );

        Ok(Submission {
            id: format!("dry-run-{}", submitted.len()),
        })
    }
}
