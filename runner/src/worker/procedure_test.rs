use super::*;
use crate::{
    catalog::{
        memory::{MemoryCatalog, Operation},
        FileMetadata,
    },
    config::CatalogConfig,
    retry::RetryPolicy,
    worker::{
        classify::{StepOutput, OUT_OF_EVENTS},
        plan::{DatabaseMirror, MountCheck, StepSpec},
    },
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    path::{Path, PathBuf},
};

const SIMU_TEMPLATE: &str = "\
/Mokka/init/dbHost 202.114.78.211
/Mokka/init/initialMacroFile event.macro
/Mokka/init/startEventNumber 0
";

const SIM_OUTPUT: &str = "/cepc/user/y/yant/higgs/sim/zh_sim.slcio";
const REC_OUTPUT: &str = "/cepc/user/y/yant/higgs/rec/zh_rec.slcio";

struct FakeHost {
    site: Option<String>,
    /// mount checks failing before the mount shows up, `None` never mounts
    mount_after: Option<u32>,
    mount_checks: Cell<u32>,
    files: RefCell<BTreeMap<String, String>>,
    outputs: BTreeMap<String, StepOutput>,
    ran: RefCell<Vec<String>>,
    sleeps: RefCell<Vec<Duration>>,
    statuses: RefCell<Vec<String>>,
}

impl FakeHost {
    fn new(site: &str, simulation: StepOutput, reconstruction: StepOutput) -> Self {
        Self {
            site: Some(site.to_string()),
            mount_after: Some(0),
            mount_checks: Cell::new(0),
            files: RefCell::new(BTreeMap::from([(
                SIMU_MACRO.to_string(),
                SIMU_TEMPLATE.to_string(),
            )])),
            outputs: BTreeMap::from([
                ("simu.sh".to_string(), simulation),
                ("reco.sh".to_string(), reconstruction),
            ]),
            ran: RefCell::new(Vec::new()),
            sleeps: RefCell::new(Vec::new()),
            statuses: RefCell::new(Vec::new()),
        }
    }

    fn simu_macro(&self) -> String {
        self.files.borrow()[SIMU_MACRO].clone()
    }
}

impl WorkerHost for FakeHost {
    fn site(&self) -> Option<String> {
        self.site.clone()
    }

    fn mount_available(&self, _path: &Path) -> bool {
        let checks = self.mount_checks.get();
        self.mount_checks.set(checks + 1);

        self.mount_after.map_or(false, |after| checks >= after)
    }

    fn read_file(&self, name: &str) -> Result<String, WorkerFailure> {
        self.files
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| WorkerFailure::Setup(format!("{name} missing")))
    }

    fn write_file(&self, name: &str, contents: &str) -> Result<(), WorkerFailure> {
        self.files
            .borrow_mut()
            .insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn run_step(&self, step: &StepSpec, software_init: &str) -> Result<StepOutput, WorkerFailure> {
        self.write_file(&step.script, &step.script_text(software_init))?;
        self.ran.borrow_mut().push(step.script.clone());

        Ok(self.outputs[&step.script].clone())
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }

    fn report_status(&self, message: &str) {
        self.statuses.borrow_mut().push(message.to_string());
    }

    fn random_seed(&self) -> u64 {
        4242
    }

    fn random_fraction(&self) -> f64 {
        0.5
    }
}

fn plan() -> WorkerPlan {
    WorkerPlan {
        job_name: "CEPC_v1_(0.1)_zh".to_string(),
        events: 100,
        start_event: 0,
        max_queue_delay: Duration::from_secs(180),
        randomize_seed: true,
        mount: MountCheck {
            path: PathBuf::from("/cvmfs/cepc.ihep.ac.cn/"),
            retry: RetryPolicy::mount(),
        },
        database: DatabaseMirror {
            default_host: "202.114.78.211".to_string(),
            mirror_host: "202.122.37.75".to_string(),
            mirror_sites: vec!["CLOUD.IHEP-OPENSTACK.cn".to_string()],
        },
        software_init: "source init.sh".to_string(),
        simulation: StepSpec::simulation(),
        reconstruction: StepSpec::reconstruction(),
        outputs: vec![SIM_OUTPUT.to_string(), REC_OUTPUT.to_string()],
        catalog: CatalogConfig::Memory,
        catalog_retry: RetryPolicy::immediate(3),
        status_exec: None,
    }
}

fn ok(log: &str) -> StepOutput {
    StepOutput {
        exit_code: 0,
        log: log.to_string(),
    }
}

fn failed(log: &str) -> StepOutput {
    StepOutput {
        exit_code: 1,
        log: log.to_string(),
    }
}

fn written(events: u64) -> String {
    format!("MyLCIOOutputProcessor: {events} events in 1 runs written to file zh_rec.slcio\n")
}

fn run(host: &FakeHost, plan: &WorkerPlan, catalog: &MemoryCatalog) -> Result<(), WorkerFailure> {
    let registrar = CatalogRegistrar::new(catalog, plan.catalog_retry.clone());

    WorkerProcedure::new(plan, host, registrar).run()
}

#[test]
pub fn complete_run_reports_done() {
    let host = FakeHost::new("CLUSTER.WHU.cn", ok(""), ok(&written(100)));

    assert_eq!(run(&host, &plan(), &MemoryCatalog::new()), Ok(()));
    assert_eq!(*host.statuses.borrow(), vec!["Done".to_string()]);
    assert_eq!(*host.ran.borrow(), vec!["simu.sh", "reco.sh"]);
    assert_eq!(*host.sleeps.borrow(), vec![Duration::from_secs(90)]);
    assert!(host.simu_macro().contains("/Mokka/init/randomSeed 4242\n/Mokka/init/dbHost"));
    assert!(host.files.borrow()["simu.sh"].contains("(time Mokka -U simu.macro) &> simu.log"));
}

#[test]
pub fn partial_simulation_lowers_expected_count() {
    let log = format!(">>> End of Event 60 in run 0\n{OUT_OF_EVENTS}\n");
    let reco = "MyLCIOOutputProcessor: +60 events in +1 runs written to file zh_rec.slcio\n";
    let host = FakeHost::new("CLUSTER.WHU.cn", failed(&log), ok(reco));

    assert_eq!(run(&host, &plan(), &MemoryCatalog::new()), Ok(()));
}

#[test]
pub fn markers_follow_the_events_actually_simulated() {
    let log = format!(">>> Begin of Event 99 in run 0\n>>> End of Event 100 in run 0\n{OUT_OF_EVENTS}\n");
    let host = FakeHost::new("CLUSTER.WHU.cn", failed(&log), ok(&written(60)));
    let mut plan = plan();
    plan.start_event = 40;

    assert_eq!(run(&host, &plan, &MemoryCatalog::new()), Ok(()));

    let stale = FakeHost::new("CLUSTER.WHU.cn", failed(&log), ok(&written(100)));
    assert_eq!(
        run(&stale, &plan, &MemoryCatalog::new()),
        Err(WorkerFailure::ValidationFailure)
    );
}

#[test]
pub fn full_count_fails_after_partial_simulation() {
    let log = format!(">>> End of Event 60 in run 0\n{OUT_OF_EVENTS}\n");
    let host = FakeHost::new("CLUSTER.WHU.cn", failed(&log), ok(&written(100)));

    assert_eq!(
        run(&host, &plan(), &MemoryCatalog::new()),
        Err(WorkerFailure::ValidationFailure)
    );
}

#[test]
pub fn missing_mount_gives_up_after_ten_checks() {
    let mut host = FakeHost::new("CLUSTER.WHU.cn", ok(""), ok(&written(100)));
    host.mount_after = None;

    let result = run(&host, &plan(), &MemoryCatalog::new());

    assert_eq!(result, Err(WorkerFailure::MountMissing));
    assert_eq!(result.unwrap_err().exit_code() as u8, 11);
    assert_eq!(host.mount_checks.get(), 10);
    assert_eq!(host.sleeps.borrow().len(), 9);
    assert!(host.ran.borrow().is_empty());
    assert_eq!(*host.statuses.borrow(), vec!["cvmfs not found".to_string()]);
}

#[test]
pub fn late_mount_is_accepted() {
    let mut host = FakeHost::new("CLOUD.WHU.cn", ok(""), ok(&written(100)));
    host.mount_after = Some(3);

    assert_eq!(run(&host, &plan(), &MemoryCatalog::new()), Ok(()));
    assert_eq!(
        *host.sleeps.borrow(),
        vec![
            Duration::from_secs(5),
            Duration::from_millis(7500),
            Duration::from_millis(11250)
        ]
    );
}

#[test]
pub fn database_failure_skips_reconstruction() {
    let host = FakeHost::new(
        "CLUSTER.WHU.cn",
        failed("Database connection failed\n"),
        ok(&written(100)),
    );

    assert_eq!(
        run(&host, &plan(), &MemoryCatalog::new()),
        Err(WorkerFailure::DatabaseUnavailable)
    );
    assert_eq!(*host.ran.borrow(), vec!["simu.sh"]);
    assert_eq!(*host.statuses.borrow(), vec!["DB connection failed".to_string()]);
}

#[test]
pub fn exhausted_input_without_events() {
    let log = format!(">>> End of Event 0 in run 0\n{OUT_OF_EVENTS}\n");
    let host = FakeHost::new("CLUSTER.WHU.cn", failed(&log), ok(""));

    let result = run(&host, &plan(), &MemoryCatalog::new());

    assert_eq!(result.unwrap_err().exit_code() as u8, 23);
}

#[test]
pub fn mirror_site_uses_local_database_without_delay() {
    let host = FakeHost::new("CLOUD.IHEP-OPENSTACK.cn", ok(""), ok(&written(100)));

    assert_eq!(run(&host, &plan(), &MemoryCatalog::new()), Ok(()));
    assert!(host.simu_macro().contains("/Mokka/init/dbHost 202.122.37.75"));
    assert!(!host.simu_macro().contains("202.114.78.211"));
    assert!(host.sleeps.borrow().is_empty());
}

#[test]
pub fn fixed_seed_is_kept() {
    let host = FakeHost::new("CLUSTER.WHU.cn", ok(""), ok(&written(100)));
    let mut plan = plan();
    plan.randomize_seed = false;

    assert_eq!(run(&host, &plan, &MemoryCatalog::new()), Ok(()));
    assert_eq!(host.simu_macro(), SIMU_TEMPLATE);
}

#[test]
pub fn cleaning_removes_stale_outputs() {
    let host = FakeHost::new("CLUSTER.WHU.cn", ok(""), ok(&written(100)));
    let catalog = MemoryCatalog::new();
    let registrar = CatalogRegistrar::new(&catalog, RetryPolicy::immediate(1));
    registrar
        .register(SIM_OUTPUT, &FileMetadata::new(1, "IHEP-STORM"))
        .unwrap();

    assert_eq!(run(&host, &plan(), &catalog), Ok(()));
    assert!(catalog.is_empty());
}

#[test]
pub fn catalog_errors_do_not_fail_the_job() {
    let host = FakeHost::new("CLUSTER.WHU.cn", ok(""), ok(&written(100)));
    let catalog = MemoryCatalog::new();
    catalog.fail_next(Operation::Query, 10);

    assert_eq!(run(&host, &plan(), &catalog), Ok(()));
    assert_eq!(*host.statuses.borrow(), vec!["Done".to_string()]);
}
