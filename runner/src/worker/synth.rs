use super::plan::{max_queue_delay, DatabaseMirror, MountCheck, StepSpec, WorkerPlan};
use crate::{
    artifacts::write_once,
    config::RunParameters,
    job::OutputNames,
    planner::BatchDescriptor,
    retry::RetryPolicy,
    templates::TemplateError,
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const JOB_SCRIPT: &str = "job.sh";
pub const JOB_PLAN: &str = "job.yaml";

const WORKER_FALLBACK_NAME: &str = "dsub";

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("Worker plan could not be serialized")]
    Serialize(#[from] serde_yaml::Error),
    #[error(transparent)]
    Write(#[from] TemplateError),
    #[error("Could not make {path} executable: {source}")]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Worker plan of one batch
pub fn worker_plan(
    params: &RunParameters,
    job_name: &str,
    batch: &BatchDescriptor,
    outputs: &OutputNames,
    total_jobs: u64,
) -> WorkerPlan {
    let worker = &params.worker;

    WorkerPlan {
        job_name: job_name.to_string(),
        events: params.events_per_batch,
        start_event: batch.start_event,
        max_queue_delay: max_queue_delay(total_jobs, params.events_per_batch),
        randomize_seed: params.seed.is_none(),
        mount: MountCheck {
            path: worker.mount_path.clone(),
            retry: RetryPolicy::mount(),
        },
        database: DatabaseMirror {
            default_host: worker.db_host.clone(),
            mirror_host: worker.db_mirror.clone(),
            mirror_sites: worker.mirror_sites.clone(),
        },
        software_init: worker.software_init.clone(),
        simulation: StepSpec::simulation(),
        reconstruction: StepSpec::reconstruction(),
        outputs: vec![outputs.sim.clone(), outputs.rec.clone()],
        catalog: params.catalog.clone(),
        catalog_retry: RetryPolicy::catalog(),
        status_exec: worker.status_exec.clone(),
    }
}

/// Entry script: runs the shipped worker binary against the plan next to it
pub fn job_script(worker_exec: &Path) -> String {
    let binary = worker_exec
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| WORKER_FALLBACK_NAME.to_string());

    format!("#!/bin/bash\nchmod +x ./{binary}\n./{binary} worker {JOB_PLAN}\n")
}

/// Write `job.sh` and `job.yaml` into the unit directory
pub fn write_procedure(dir: &Path, worker_exec: &Path, plan: &WorkerPlan) -> Result<(), SynthError> {
    let script = dir.join(JOB_SCRIPT);

    write_once(&dir.join(JOB_PLAN), &serde_yaml::to_string(plan)?)?;
    write_once(&script, &job_script(worker_exec))?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
        .map_err(|source| SynthError::Permissions {
            path: script.clone(),
            source,
        })?;

    debug!(dir = ?dir, "Wrote worker procedure");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_parameters as params;
    use std::time::Duration;

    fn outputs() -> OutputNames {
        OutputNames {
            sim: "/cepc/user/y/yant/higgs/sim/zh_sim_00002.slcio".to_string(),
            rec: "/cepc/user/y/yant/higgs/rec/zh_rec_00002.slcio".to_string(),
        }
    }

    fn batch() -> BatchDescriptor {
        BatchDescriptor {
            index: 1,
            label: "_00002".to_string(),
            start_event: 100,
        }
    }

    #[test]
    fn plan_follows_run_parameters() {
        let plan = worker_plan(&params(None), "CEPC_v1_(0.2)_zh_00002", &batch(), &outputs(), 60);

        assert_eq!(plan.events, 100);
        assert_eq!(plan.start_event, 100);
        assert_eq!(plan.max_queue_delay, Duration::from_secs(360));
        assert!(plan.randomize_seed);
        assert_eq!(plan.outputs, vec![outputs().sim, outputs().rec]);
        assert_eq!(plan.mount.retry.attempts, 10);
    }

    #[test]
    fn fixed_seed_disables_randomization() {
        let plan = worker_plan(&params(Some(7)), "job", &batch(), &outputs(), 1);

        assert!(!plan.randomize_seed);
        assert_eq!(plan.max_queue_delay, Duration::ZERO);
    }

    #[test]
    fn writes_plan_and_entry_script_once() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(None);
        let plan = worker_plan(&params, "job", &batch(), &outputs(), 1);

        write_procedure(dir.path(), &params.worker.exec, &plan).unwrap();

        let script = fs::read_to_string(dir.path().join(JOB_SCRIPT)).unwrap();
        assert!(script.ends_with("./dsub worker job.yaml\n"));
        let stored: WorkerPlan =
            serde_yaml::from_str(&fs::read_to_string(dir.path().join(JOB_PLAN)).unwrap()).unwrap();
        assert_eq!(stored, plan);

        assert!(matches!(
            write_procedure(dir.path(), &params.worker.exec, &plan),
            Err(SynthError::Write(TemplateError::Write { .. }))
        ));
    }
}
