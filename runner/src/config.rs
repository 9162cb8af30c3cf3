use chrono::NaiveDateTime;
use itertools::Itertools;
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::{
    fs,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// sites jobs may be sent to
pub const KNOWN_SITES: [&str; 11] = [
    "CLOUD.IHEP-OPENSTACK.cn",
    "CLOUD.IHEP-OPENNEBULA.cn",
    "CLOUD.IHEP-PUBLIC.cn",
    "CLOUD.WHU.cn",
    "CLUSTER.WHU.cn",
    "CLUSTER.SJTU.cn",
    "CLUSTER.PKU.cn",
    "CLUSTER.GXU.cn",
    "CLUSTER.BUAA.cn",
    "CLUSTER.SDU-MLL.cn",
    "CLUSTER.SDU-HXT.cn",
];

/// sites with a local copy of the geometry database
pub const MIRROR_SITES: [&str; 2] = ["CLOUD.IHEP-OPENSTACK.cn", "CLOUD.IHEP-OPENNEBULA.cn"];

const DEFAULT_SITES: [&str; 3] = [
    "CLOUD.IHEP-OPENSTACK.cn",
    "CLOUD.IHEP-OPENNEBULA.cn",
    "CLUSTER.WHU.cn",
];

const DEFAULT_SOFTWARE_INIT: &str = "unset MARLIN_DLL
export ILC_HOME=/cvmfs/cepc.ihep.ac.cn/cepcsoft/x64_SL6/xuyin/ilcsoft/v01-17-05
source $ILC_HOME/init_ilcsoft_150612.sh";

/// keys holding integers, everything else but `sites` is a plain string
const INTEGER_KEYS: [&str; 5] = ["seed", "evtmax", "evtstart", "batch", "cpu_time"];

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("{path} is not a job config file: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Key '{key}' expects an integer, got '{value}'")]
    InvalidInteger { key: String, value: String },
    #[error("Config could not be deserialized")]
    Deserialize(#[from] serde_yaml::Error),
    #[error("No user identity available, pass --user or set DIRAC_USER")]
    MissingIdentity,
    #[error("Config failed {0} preflight check(s)")]
    Preflight(usize),
}

/// Identity of the submitting user, resolved once at startup
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Result<Self, ConfigErrors> {
        let username = username.into();

        if username.trim().is_empty() {
            Err(ConfigErrors::MissingIdentity)
        } else {
            Ok(Self { username })
        }
    }

    /// personal catalog area, e.g. `/cepc/user/y/yant/`
    pub fn lfn_home(&self, root: &str) -> String {
        let initial = self.username.chars().next().unwrap_or('_');

        format!("{}/{initial}/{}/", root.trim_end_matches('/'), self.username)
    }
}

/// Parse a `key = value` job config, `#` starts a comment.
/// Lines without `=` are skipped, later keys override earlier ones.
pub fn parse_key_values(text: &str) -> Result<Mapping, ConfigErrors> {
    let mut mapping = Mapping::new();

    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        let value = if INTEGER_KEYS.contains(&key) {
            Value::from(
                value
                    .parse::<u64>()
                    .map_err(|_| ConfigErrors::InvalidInteger {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?,
            )
        } else if key == "sites" {
            Value::Sequence(
                value
                    .split(',')
                    .map(|site| site.split_whitespace().collect::<String>())
                    .filter(|site| !site.is_empty())
                    .map(Value::from)
                    .collect(),
            )
        } else {
            Value::from(value)
        };

        mapping.insert(Value::from(key), value);
    }

    Ok(mapping)
}

/// Raw, unresolved job config as written by the user. Unknown keys are ignored.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct UserConfig {
    #[serde(default = "default_evtmax")]
    pub evtmax: u64,
    #[serde(default)]
    pub evtstart: u64,
    #[serde(default = "default_batch")]
    pub batch: u64,
    pub seed: Option<u64>,
    #[serde(default = "default_sites")]
    pub sites: Vec<String>,
    pub job_group: Option<String>,

    pub work_dir: Option<PathBuf>,
    pub repo_dir: Option<PathBuf>,
    pub input_dir: Option<PathBuf>,
    pub input_filelist: Option<PathBuf>,
    pub output_dir: Option<String>,
    pub output_dir_sim: Option<String>,
    pub output_dir_rec: Option<String>,

    #[serde(default = "default_input_prefix")]
    pub input_prefix: PathBuf,
    #[serde(default = "default_input_lfn_prefix")]
    pub input_lfn_prefix: String,
    #[serde(default = "default_user_lfn_root")]
    pub user_lfn_root: String,
    #[serde(default = "default_storage_element")]
    pub storage_element: String,
    #[serde(default = "default_cpu_time")]
    pub cpu_time: u64,

    #[serde(default = "default_mount_path")]
    pub mount_path: PathBuf,
    #[serde(default = "default_software_init")]
    pub software_init: String,
    #[serde(default = "default_db_host")]
    pub db_host: String,
    #[serde(default = "default_db_mirror")]
    pub db_mirror: String,

    #[serde(default = "default_submitter")]
    pub submitter: String,
    pub submit_exec: Option<PathBuf>,
    #[serde(default = "default_catalog")]
    pub catalog: String,
    pub catalog_exec: Option<PathBuf>,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout: u64,
    pub worker_exec: Option<PathBuf>,
    pub status_exec: Option<PathBuf>,
}

impl UserConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let text = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigErrors> {
        let mapping = parse_key_values(text)?;

        let known = serde_yaml::to_value(Self::from_mapping(Mapping::new())?)?;
        for key in mapping.keys().filter_map(Value::as_str) {
            if known.get(key).is_none() {
                debug!(key = key, "Ignoring unrecognized config key");
            }
        }

        Self::from_mapping(mapping)
    }

    fn from_mapping(mapping: Mapping) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_value(Value::Mapping(mapping))?)
    }
}

/// Where the input `.stdhep` files are found
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSource {
    Directory(PathBuf),
    FileList(PathBuf),
}

/// Catalog directories (relative to the user's home) the outputs are registered under
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputLayout {
    /// `<dir>/sim` and `<dir>/rec`
    Shared(String),
    Split { sim: String, rec: String },
}

impl OutputLayout {
    pub fn sim_dir(&self) -> String {
        match self {
            Self::Shared(dir) => format!("{}/sim", dir.trim_end_matches('/')),
            Self::Split { sim, .. } => sim.trim_end_matches('/').to_string(),
        }
    }

    pub fn rec_dir(&self) -> String {
        match self {
            Self::Shared(dir) => format!("{}/rec", dir.trim_end_matches('/')),
            Self::Split { rec, .. } => rec.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum CatalogConfig {
    Memory,
    Exec { exec: PathBuf, timeout_ms: u64 },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum SubmitterConfig {
    DryRun,
    Exec { exec: PathBuf, timeout_ms: u64 },
}

/// Settings baked into every worker plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub mount_path: PathBuf,
    pub software_init: String,
    pub db_host: String,
    pub db_mirror: String,
    pub mirror_sites: Vec<String>,
    pub exec: PathBuf,
    /// reports application status from the worker, `<exec> <job id> <message>`
    pub status_exec: Option<PathBuf>,
}

/// Resolved and validated configuration of one run, immutable once built
#[derive(Clone, Debug)]
pub struct RunParameters {
    pub identity: Identity,
    pub events_per_batch: u64,
    pub start_event: u64,
    pub batches: u64,
    pub seed: Option<u64>,
    pub sites: Vec<String>,
    pub job_group: String,
    pub work_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub input: InputSource,
    pub input_prefix: PathBuf,
    pub output: OutputLayout,
    pub input_lfn_prefix: String,
    pub user_lfn_root: String,
    pub storage_element: String,
    pub cpu_time: Duration,
    pub worker: WorkerSettings,
    pub submitter: SubmitterConfig,
    pub catalog: CatalogConfig,
}

impl RunParameters {
    /// Resolve defaults and run every preflight check.
    /// All problems are logged before failing to make fixing a config a one-pass affair.
    pub fn resolve(
        config: UserConfig,
        identity: Identity,
        cwd: &Path,
        now: NaiveDateTime,
        current_exe: &Path,
    ) -> Result<Self, ConfigErrors> {
        let mut problems = Vec::new();

        let input = match (&config.input_filelist, &config.input_dir) {
            (Some(list), _) => Some(InputSource::FileList(list.clone())),
            (None, Some(dir)) => Some(InputSource::Directory(dir.clone())),
            (None, None) => {
                problems.push("Neither 'input_dir' nor 'input_filelist' is assigned".to_string());
                None
            }
        };

        let output = match (
            &config.output_dir,
            &config.output_dir_sim,
            &config.output_dir_rec,
        ) {
            (Some(dir), _, _) => Some(OutputLayout::Shared(dir.clone())),
            (None, Some(sim), Some(rec)) => Some(OutputLayout::Split {
                sim: sim.clone(),
                rec: rec.clone(),
            }),
            _ => {
                problems.push(
                    "'output_dir' or both 'output_dir_sim' and 'output_dir_rec' must be given"
                        .to_string(),
                );
                None
            }
        };

        if config.evtmax == 0 {
            problems.push("'evtmax' must be at least 1".to_string());
        }
        if config.batch == 0 {
            problems.push("'batch' must be at least 1".to_string());
        }

        let repo_dir = config.repo_dir.clone().unwrap_or_else(|| cwd.to_path_buf());
        if !repo_dir.is_dir() || access(&repo_dir, AccessFlags::W_OK).is_err() {
            problems.push(format!(
                "repo_dir {} is not a writable directory",
                repo_dir.display()
            ));
        }

        match &input {
            Some(InputSource::Directory(dir)) => {
                if !dir.is_dir() {
                    problems.push(format!("input_dir {} is not a directory", dir.display()));
                } else if !dir.starts_with(&config.input_prefix) {
                    problems.push(format!(
                        "input_dir {} should be in {}",
                        dir.display(),
                        config.input_prefix.display()
                    ));
                }
            }
            Some(InputSource::FileList(list)) => {
                if !list.is_file() {
                    problems.push(format!("input_filelist {} is not a file", list.display()));
                }
            }
            None => {}
        }

        if config.sites.is_empty() {
            problems.push("'sites' is empty".to_string());
        }
        for site in config.sites.iter().filter(|site| !KNOWN_SITES.contains(&site.as_str())) {
            problems.push(format!("{site} is not a valid CEPC site"));
        }

        let submitter = match config.submitter.to_lowercase().as_str() {
            "dry-run" | "dryrun" => Some(SubmitterConfig::DryRun),
            "exec" => match &config.submit_exec {
                Some(exec) => Some(SubmitterConfig::Exec {
                    exec: exec.clone(),
                    timeout_ms: config.exec_timeout,
                }),
                None => {
                    problems.push("submitter 'exec' requires 'submit_exec'".to_string());
                    None
                }
            },
            other => {
                problems.push(format!("submitter '{other}' is not supported, use dry-run or exec"));
                None
            }
        };

        let catalog = match config.catalog.to_lowercase().as_str() {
            "memory" => Some(CatalogConfig::Memory),
            "exec" => match &config.catalog_exec {
                Some(exec) => Some(CatalogConfig::Exec {
                    exec: exec.clone(),
                    timeout_ms: config.exec_timeout,
                }),
                None => {
                    problems.push("catalog 'exec' requires 'catalog_exec'".to_string());
                    None
                }
            },
            other => {
                problems.push(format!("catalog '{other}' is not supported, use memory or exec"));
                None
            }
        };

        for problem in problems.iter() {
            error!("{problem}");
        }

        match (input, output, submitter, catalog) {
            (Some(input), Some(output), Some(submitter), Some(catalog)) if problems.is_empty() => {
                let job_group = match &config.job_group {
                    Some(label) => format!(
                        "{}_{}_{}",
                        identity.username,
                        now.format("%y%m%d"),
                        label
                    ),
                    None => format!("{}_{}cepc_sr", identity.username, now.format("%y%m%d_%H%M")),
                };

                if config.sites.iter().duplicates().next().is_some() {
                    warn!("'sites' contains duplicates, they are collapsed");
                }

                Ok(Self {
                    identity,
                    events_per_batch: config.evtmax,
                    start_event: config.evtstart,
                    batches: config.batch,
                    seed: config.seed,
                    sites: config.sites.into_iter().unique().collect(),
                    job_group,
                    work_dir: config.work_dir.unwrap_or_else(|| cwd.to_path_buf()),
                    repo_dir,
                    input,
                    input_prefix: config.input_prefix,
                    output,
                    input_lfn_prefix: config.input_lfn_prefix,
                    user_lfn_root: config.user_lfn_root,
                    storage_element: config.storage_element,
                    cpu_time: Duration::from_secs(config.cpu_time),
                    worker: WorkerSettings {
                        mount_path: config.mount_path,
                        software_init: config.software_init,
                        db_host: config.db_host,
                        db_mirror: config.db_mirror,
                        mirror_sites: MIRROR_SITES.iter().map(|site| site.to_string()).collect(),
                        exec: config
                            .worker_exec
                            .unwrap_or_else(|| current_exe.to_path_buf()),
                        status_exec: config.status_exec,
                    },
                    submitter,
                    catalog,
                })
            }
            _ => Err(ConfigErrors::Preflight(problems.len())),
        }
    }

    /// personal catalog area of the submitting user
    pub fn lfn_home(&self) -> String {
        self.identity.lfn_home(&self.user_lfn_root)
    }
}

fn default_evtmax() -> u64 {
    10
}

fn default_batch() -> u64 {
    1
}

fn default_sites() -> Vec<String> {
    DEFAULT_SITES.iter().map(|site| site.to_string()).collect()
}

fn default_input_prefix() -> PathBuf {
    PathBuf::from("/cefs/")
}

fn default_input_lfn_prefix() -> String {
    "/cepc/lustre-ro".to_string()
}

fn default_user_lfn_root() -> String {
    "/cepc/user".to_string()
}

fn default_storage_element() -> String {
    "IHEP-STORM".to_string()
}

fn default_cpu_time() -> u64 {
    86400
}

fn default_mount_path() -> PathBuf {
    PathBuf::from("/cvmfs/cepc.ihep.ac.cn/")
}

fn default_software_init() -> String {
    DEFAULT_SOFTWARE_INIT.to_string()
}

fn default_db_host() -> String {
    "202.114.78.211".to_string()
}

fn default_db_mirror() -> String {
    "202.122.37.75".to_string()
}

fn default_submitter() -> String {
    "dry-run".to_string()
}

fn default_catalog() -> String {
    "memory".to_string()
}

fn default_exec_timeout() -> u64 {
    60_000
}

/// Fully resolved parameters for unit tests, without touching the filesystem
#[cfg(test)]
pub(crate) fn test_parameters(seed: Option<u64>) -> RunParameters {
    RunParameters {
        identity: Identity {
            username: "yant".to_string(),
        },
        events_per_batch: 100,
        start_event: 0,
        batches: 60,
        seed,
        sites: vec!["CLUSTER.WHU.cn".to_string()],
        job_group: "yant_150615_zh".to_string(),
        work_dir: PathBuf::from("/work"),
        repo_dir: PathBuf::from("/repo"),
        input: InputSource::Directory(PathBuf::from("/cefs/zh")),
        input_prefix: PathBuf::from("/cefs/"),
        output: OutputLayout::Shared("higgs".to_string()),
        input_lfn_prefix: "/cepc/lustre-ro".to_string(),
        user_lfn_root: "/cepc/user".to_string(),
        storage_element: "IHEP-STORM".to_string(),
        cpu_time: Duration::from_secs(86400),
        worker: WorkerSettings {
            mount_path: PathBuf::from("/cvmfs/cepc.ihep.ac.cn/"),
            software_init: "source init.sh".to_string(),
            db_host: "202.114.78.211".to_string(),
            db_mirror: "202.122.37.75".to_string(),
            mirror_sites: vec!["CLOUD.IHEP-OPENSTACK.cn".to_string()],
            exec: PathBuf::from("/usr/local/bin/dsub"),
            status_exec: None,
        },
        submitter: SubmitterConfig::DryRun,
        catalog: CatalogConfig::Memory,
    }
}
