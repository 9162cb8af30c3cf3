use crate::{config::CatalogConfig, retry::RetryPolicy};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Upper bound of the randomized start delay, sized by expected load.
///
/// Small runs and short jobs start right away; larger runs spread their start
/// over up to fifteen minutes to avoid hammering shared sites.
pub fn max_queue_delay(total_jobs: u64, events: u64) -> Duration {
    let minutes = if total_jobs < 50 || events < 30 {
        0
    } else if events < 60 {
        3
    } else if events < 120 {
        6
    } else {
        15
    };

    Duration::from_secs(minutes * 60)
}

/// Shared software area the job cannot run without
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MountCheck {
    pub path: PathBuf,
    pub retry: RetryPolicy,
}

/// Geometry database host, switched to a local mirror on some sites
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseMirror {
    pub default_host: String,
    pub mirror_host: String,
    pub mirror_sites: Vec<String>,
}

/// One external tool invocation
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    /// shell script written before running, e.g. `simu.sh`
    pub script: String,
    /// combined output of the tool, e.g. `simu.log`
    pub log: String,
    pub command: String,
}

impl StepSpec {
    pub fn simulation() -> Self {
        Self {
            script: "simu.sh".to_string(),
            log: "simu.log".to_string(),
            command: "Mokka -U simu.macro".to_string(),
        }
    }

    pub fn reconstruction() -> Self {
        Self {
            script: "reco.sh".to_string(),
            log: "reco.log".to_string(),
            command: "Marlin reco.xml".to_string(),
        }
    }

    pub fn script_text(&self, software_init: &str) -> String {
        format!(
            "#!/bin/bash\n{}\n(time {}) &> {}\n",
            software_init.trim_end(),
            self.command,
            self.log
        )
    }
}

/// Everything the worker needs on the compute node, written as `job.yaml`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkerPlan {
    pub job_name: String,
    /// events requested for this batch
    pub events: u64,
    /// absolute number of the first event of this batch
    pub start_event: u64,
    #[serde(with = "seconds")]
    pub max_queue_delay: Duration,
    /// inject a fresh random seed before simulating
    pub randomize_seed: bool,
    pub mount: MountCheck,
    pub database: DatabaseMirror,
    pub software_init: String,
    pub simulation: StepSpec,
    pub reconstruction: StepSpec,
    /// catalog names of the simulation and reconstruction outputs
    pub outputs: Vec<String>,
    pub catalog: CatalogConfig,
    pub catalog_retry: RetryPolicy,
    #[serde(default)]
    pub status_exec: Option<PathBuf>,
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
