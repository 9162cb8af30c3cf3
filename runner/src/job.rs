use crate::{
    artifacts::{ArtifactContext, ArtifactPaths},
    collector::InputItem,
    config::RunParameters,
    layout::{MasterRepository, UnitDirectory},
    templates::{PANDORA_LIKELIHOOD, PANDORA_SETTINGS},
    worker::{
        synth::{JOB_PLAN, JOB_SCRIPT},
        STATUS_FILE,
    },
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// files the worker produces that are fetched back after the job ends
pub const OUTPUT_SANDBOX: [&str; 9] = [
    "script.log",
    "simu.macro",
    "event.macro",
    "simu.sh",
    "simu.log",
    "reco.xml",
    "reco.sh",
    "reco.log",
    STATUS_FILE,
];

pub const SCRIPT_LOG: &str = "script.log";

/// Catalog reference as written in sandboxes and output declarations
pub fn lfn_reference(lfn: &str) -> String {
    format!("LFN:{lfn}")
}

/// Everything the submission system needs for one unit of work.
/// Built once per batch and never changed afterwards.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub name: String,
    pub group: String,
    pub executable: String,
    pub executable_log: String,
    pub input_sandbox: Vec<String>,
    pub output_sandbox: Vec<String>,
    /// `LFN:` prefixed simulation and reconstruction outputs
    pub output_data: Vec<String>,
    pub storage_element: String,
    pub sites: Vec<String>,
    /// CPU time limit in seconds
    pub cpu_time: u64,
}

/// Catalog names of the two outputs of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNames {
    pub sim: String,
    pub rec: String,
}

impl OutputNames {
    pub fn new(params: &RunParameters, context: &ArtifactContext) -> Self {
        let home = params.lfn_home();

        Self {
            sim: format!("{home}{}/{}", params.output.sim_dir(), context.sim_file()),
            rec: format!("{home}{}/{}", params.output.rec_dir(), context.rec_file()),
        }
    }
}

impl JobDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        params: &RunParameters,
        master: &MasterRepository,
        unit: &UnitDirectory,
        input: &InputItem,
        input_lfn: &str,
        batch_label: &str,
        artifacts: &ArtifactPaths,
        outputs: &OutputNames,
    ) -> Self {
        Self {
            name: format!(
                "CEPC_v1_({}.{})_{}{}",
                master.name(),
                unit.index,
                input.stem(),
                batch_label
            ),
            group: params.job_group.clone(),
            executable: JOB_SCRIPT.to_string(),
            executable_log: SCRIPT_LOG.to_string(),
            input_sandbox: vec![
                display(&unit.path.join(JOB_SCRIPT)),
                display(&unit.path.join(JOB_PLAN)),
                display(&params.worker.exec),
                display(&master.path().join(PANDORA_SETTINGS)),
                display(&master.path().join(PANDORA_LIKELIHOOD)),
                display(&artifacts.event_macro),
                display(&artifacts.simu_macro),
                display(&artifacts.reco_xml),
                lfn_reference(input_lfn),
            ],
            output_sandbox: OUTPUT_SANDBOX.iter().map(|file| file.to_string()).collect(),
            output_data: vec![lfn_reference(&outputs.sim), lfn_reference(&outputs.rec)],
            storage_element: params.storage_element.clone(),
            sites: params.sites.clone(),
            cpu_time: params.cpu_time.as_secs(),
        }
    }
}

/// catalog name of an input file
pub fn input_lfn(params: &RunParameters, input: &InputItem) -> String {
    format!(
        "{}{}",
        params.input_lfn_prefix.trim_end_matches('/'),
        input.path.to_string_lossy()
    )
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::test_parameters, planner::BatchDescriptor};
    use std::path::PathBuf;

    fn input() -> InputItem {
        InputItem {
            path: PathBuf::from("/cefs/higgs/zh.stdhep"),
            size: 1024,
            name: "zh.stdhep".to_string(),
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
    fn output_names_live_in_the_user_home() {
        let params = test_parameters(None);
        let input = input();
        let batch = batch();
        let context = ArtifactContext {
            input_name: &input.name,
            stem: input.stem(),
            batch: &batch,
            events: params.events_per_batch,
            seed: None,
        };

        let outputs = OutputNames::new(&params, &context);

        assert_eq!(outputs.sim, "/cepc/user/y/yant/higgs/sim/zh_sim_00002.slcio");
        assert_eq!(outputs.rec, "/cepc/user/y/yant/higgs/rec/zh_rec_00002.slcio");
    }

    #[test]
    fn input_lfn_keeps_the_absolute_path() {
        assert_eq!(
            input_lfn(&test_parameters(None), &input()),
            "/cepc/lustre-ro/cefs/higgs/zh.stdhep"
        );
        assert_eq!(lfn_reference("/cepc/a"), "LFN:/cepc/a");
    }

    #[test]
    fn descriptor_ships_everything_the_worker_needs() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_parameters(None);
        let mut master = MasterRepository::create(dir.path()).unwrap();
        let unit = master.allocate_unit().unwrap();
        let artifacts = ArtifactPaths {
            event_macro: unit.path.join("event.macro"),
            simu_macro: unit.path.join("simu.macro"),
            reco_xml: unit.path.join("reco.xml"),
        };
        let outputs = OutputNames {
            sim: "/cepc/user/y/yant/higgs/sim/zh_sim_00002.slcio".to_string(),
            rec: "/cepc/user/y/yant/higgs/rec/zh_rec_00002.slcio".to_string(),
        };

        let job = JobDescriptor::build(
            &params,
            &master,
            &unit,
            &input(),
            "/cepc/lustre-ro/cefs/higgs/zh.stdhep",
            "_00002",
            &artifacts,
            &outputs,
        );

        assert_eq!(job.name, "CEPC_v1_(0.1)_zh_00002");
        assert_eq!(job.executable, "job.sh");
        assert_eq!(job.input_sandbox.len(), 9);
        assert_eq!(
            job.input_sandbox.last().map(String::as_str),
            Some("LFN:/cepc/lustre-ro/cefs/higgs/zh.stdhep")
        );
        assert!(job
            .input_sandbox
            .contains(&"/usr/local/bin/dsub".to_string()));
        assert_eq!(
            job.output_data,
            vec![
                "LFN:/cepc/user/y/yant/higgs/sim/zh_sim_00002.slcio".to_string(),
                "LFN:/cepc/user/y/yant/higgs/rec/zh_rec_00002.slcio".to_string()
            ]
        );
        assert_eq!(
            job.output_sandbox,
            vec![
                "script.log",
                "simu.macro",
                "event.macro",
                "simu.sh",
                "simu.log",
                "reco.xml",
                "reco.sh",
                "reco.log",
                "status.yaml"
            ]
        );
        assert_eq!(job.cpu_time, 86400);
    }
}
