use super::{
    classify::{classify_simulation, reconstruction_succeeded, FailureKind, StepResult},
    host::WorkerHost,
    plan::WorkerPlan,
    WorkerFailure,
};
use crate::{
    catalog::{Catalog, CatalogRegistrar},
    templates::{inject_seed, DB_HOST, SIMU_MACRO},
};
use chrono::Local;
use std::{fmt, time::Duration};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Preparing,
    Queued,
    Simulating,
    Reconstructing,
    Validating,
    Cleaning,
    Done,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preparing => "Preparing",
            Self::Queued => "Queued",
            Self::Simulating => "Simulating",
            Self::Reconstructing => "Reconstructing",
            Self::Validating => "Validating",
            Self::Cleaning => "Cleaning",
            Self::Done => "Done",
        };

        f.write_str(name)
    }
}

/// Runs one batch on the compute node, see `WorkerState` for the stages
pub struct WorkerProcedure<'a, H, C> {
    plan: &'a WorkerPlan,
    host: &'a H,
    registrar: CatalogRegistrar<C>,
}

impl<'a, H: WorkerHost, C: Catalog> WorkerProcedure<'a, H, C> {
    pub fn new(plan: &'a WorkerPlan, host: &'a H, registrar: CatalogRegistrar<C>) -> Self {
        Self {
            plan,
            host,
            registrar,
        }
    }

    /// Run every stage in order. Failures are reported through the host before returning.
    pub fn run(&self) -> Result<(), WorkerFailure> {
        match self.stages() {
            Ok(()) => {
                self.enter(WorkerState::Done);
                self.host.report_status("Done");
                Ok(())
            }
            Err(failure) => {
                error!(job = %self.plan.job_name, code = ?failure.exit_code(), "{failure}");
                self.host.report_status(&failure.to_string());
                Err(failure)
            }
        }
    }

    fn stages(&self) -> Result<(), WorkerFailure> {
        self.enter(WorkerState::Preparing);
        let site = self.host.site();
        self.prepare(site.as_deref())?;

        self.enter(WorkerState::Queued);
        self.queue(site.as_deref());

        self.enter(WorkerState::Simulating);
        let expected = self.simulate()?;

        self.enter(WorkerState::Reconstructing);
        let output = self
            .host
            .run_step(&self.plan.reconstruction, &self.plan.software_init)?;
        debug!(exit_code = output.exit_code, "Reconstruction finished");

        self.enter(WorkerState::Validating);
        if !reconstruction_succeeded(&output.log, expected) {
            return Err(WorkerFailure::ValidationFailure);
        }

        self.enter(WorkerState::Cleaning);
        self.clean();

        Ok(())
    }

    fn enter(&self, state: WorkerState) {
        info!(
            job = %self.plan.job_name,
            "==================== {state} {} ====================",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
    }

    fn prepare(&self, site: Option<&str>) -> Result<(), WorkerFailure> {
        let mount = &self.plan.mount;
        mount
            .retry
            .run_with_sleep(
                |attempt| {
                    if self.host.mount_available(&mount.path) {
                        Ok(())
                    } else {
                        Err(format!(
                            "{} not available (attempt {attempt})",
                            mount.path.display()
                        ))
                    }
                },
                |delay| self.host.sleep(delay),
            )
            .map_err(|_| WorkerFailure::MountMissing)?;

        let original = self.host.read_file(SIMU_MACRO)?;
        let mut simu_macro = original.clone();

        let database = &self.plan.database;
        if let Some(site) = site.filter(|site| database.mirror_sites.iter().any(|m| m == site)) {
            info!(site = site, mirror = %database.mirror_host, "Using local database mirror");
            simu_macro = simu_macro
                .lines()
                .map(|line| {
                    if line.starts_with(DB_HOST) {
                        line.replace(&database.default_host, &database.mirror_host)
                    } else {
                        line.to_string()
                    }
                })
                .fold(String::new(), |mut text, line| {
                    text.push_str(&line);
                    text.push('\n');
                    text
                });
        }

        if self.plan.randomize_seed {
            let seed = self.host.random_seed();
            match inject_seed(&simu_macro, seed) {
                Some(seeded) => {
                    info!(seed = seed, "Injected random seed");
                    simu_macro = seeded;
                }
                None => warn!("No place for a random seed in {SIMU_MACRO}"),
            }
        }

        if simu_macro != original {
            self.host.write_file(SIMU_MACRO, &simu_macro)?;
        }

        Ok(())
    }

    fn queue(&self, site: Option<&str>) {
        let delay = match site {
            Some(site) if site.starts_with("CLOUD") => Duration::ZERO,
            _ => self
                .plan
                .max_queue_delay
                .mul_f64(self.host.random_fraction().clamp(0.0, 1.0)),
        };

        if !delay.is_zero() {
            info!(delay = ?delay, "Delaying start");
            self.host.sleep(delay);
        }
    }

    /// run the simulation, returning the number of events reconstruction must see
    fn simulate(&self) -> Result<u64, WorkerFailure> {
        let output = self
            .host
            .run_step(&self.plan.simulation, &self.plan.software_init)?;

        match classify_simulation(&output, self.plan.start_event) {
            StepResult::Success => Ok(self.plan.events),
            StepResult::Partial { last_event } => {
                let events = last_event - self.plan.start_event;
                warn!(
                    last_event = last_event,
                    events = events,
                    "Input ran out of events, continuing with what was simulated"
                );
                Ok(events)
            }
            StepResult::Failure { kind, detail } => {
                error!(detail = %detail, "Simulation failed");

                Err(match kind {
                    FailureKind::DatabaseUnavailable => WorkerFailure::DatabaseUnavailable,
                    FailureKind::ConvergenceFailure => WorkerFailure::ConvergenceFailure,
                    FailureKind::InputExhausted => WorkerFailure::InputExhausted,
                    FailureKind::Generic => WorkerFailure::SimulationGeneric,
                })
            }
        }
    }

    fn clean(&self) {
        for lfn in self.plan.outputs.iter() {
            match self.registrar.cleanup(lfn) {
                Ok(cleanup) => debug!(lfn = %lfn, removed = cleanup.removed, "Output slot checked"),
                Err(error) => error!(lfn = %lfn, error = %error, "Could not clean up output record"),
            }
        }
    }
}

#[cfg(test)]
#[path = "procedure_test.rs"]
mod procedure_test;
