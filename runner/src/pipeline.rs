use crate::{
    artifacts::ArtifactContext,
    catalog::{Catalog, CatalogRegistrar, FileMetadata},
    collector::{Collector, DiscoveryError},
    config::{ConfigErrors, RunParameters},
    executors::Submitter,
    job::{input_lfn, JobDescriptor, OutputNames},
    layout::{LayoutError, MasterRepository},
    planner::BatchPlanner,
    templates::{TemplateError, TemplateStore},
    worker::synth::{worker_plan, write_procedure, SynthError},
};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Errors that end a planning run
#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Synth(#[from] SynthError),
}

/// What a planning run got done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub master: PathBuf,
    pub files_total: usize,
    pub files_processed: usize,
    pub jobs_total: u64,
    pub jobs_submitted: u64,
    /// job ids handed out by the submission system, in submission order
    pub job_ids: Vec<String>,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            "{} of {} input files are successfully processed. {} lost.",
            self.files_processed,
            self.files_total,
            self.files_total - self.files_processed
        );
        info!(
            "{} of {} jobs are successfully processed. {} lost.",
            self.jobs_submitted,
            self.jobs_total,
            self.jobs_total - self.jobs_submitted
        );
    }
}

/// Plan every (input, batch) pair of the run into its own unit directory and
/// submit one job per unit.
///
/// Discovery, layout and template problems abort the run before anything is
/// submitted. Catalog and submission problems only cost the affected input or job.
#[instrument(level = "info", skip_all, fields(group = %params.job_group))]
pub fn split_and_submit<S, C>(
    params: &RunParameters,
    submitter: &S,
    registrar: &CatalogRegistrar<C>,
) -> Result<RunSummary, PlanError>
where
    S: Submitter,
    C: Catalog,
{
    let inputs = Collector::load(&params.input, &params.input_prefix)?.collect()?;
    let planner = BatchPlanner::from(params);
    let jobs_total = inputs.len() as u64 * params.batches;
    info!("There are {} input .stdhep files to be processed.", inputs.len());

    let mut master = MasterRepository::create(&params.repo_dir)?;
    let templates = TemplateStore::load(&params.work_dir, &params.worker.db_host)?;
    templates.install_shared(master.path())?;

    let mut summary = RunSummary {
        master: master.path().to_path_buf(),
        files_total: inputs.len(),
        files_processed: 0,
        jobs_total,
        jobs_submitted: 0,
        job_ids: Vec::new(),
    };
    let mut job_index = 0;

    for input in inputs.iter() {
        let lfn = input_lfn(params, input);
        match registrar.register(&lfn, &FileMetadata::new(input.size, &params.storage_element)) {
            Ok(cleanup) if cleanup.removed => info!(lfn = %lfn, "Replaced stale input record"),
            Ok(_) => info!(lfn = %lfn, "Registered input"),
            Err(error) => warn!(error = %error, "Input registration failed, planning continues"),
        }

        for batch in planner.plan() {
            let unit = master.allocate_unit()?;
            let context = ArtifactContext {
                input_name: &input.name,
                stem: input.stem(),
                batch: &batch,
                events: params.events_per_batch,
                seed: params.seed.map(|seed| seed.wrapping_add(job_index)),
            };
            job_index += 1;

            let artifacts = templates.render(&context)?.write(&unit.path)?;
            let outputs = OutputNames::new(params, &context);
            let job = JobDescriptor::build(
                params,
                &master,
                &unit,
                input,
                &lfn,
                &batch.label,
                &artifacts,
                &outputs,
            );

            let plan = worker_plan(params, &job.name, &batch, &outputs, jobs_total);
            write_procedure(&unit.path, &params.worker.exec, &plan)?;

            match submitter.submit(&job) {
                Ok(submission) => {
                    info!(
                        "Job {} submitted successfully. ID = {}",
                        job.name, submission.id
                    );
                    summary.jobs_submitted += 1;
                    summary.job_ids.push(submission.id);
                }
                Err(error) => error!(error = %error, "Job {} submission failed", job.name),
            }
        }

        summary.files_processed += 1;
    }

    summary.log();

    Ok(summary)
}
