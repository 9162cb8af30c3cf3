use crate::config::InputSource;
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    fs,
    io::Error,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// extension of generator files the simulation consumes
pub const INPUT_GLOB: &str = "*.stdhep";

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Input glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("Failed to read {path}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("No .stdhep files found in {0}")]
    NoInputs(PathBuf),
}

/// One source file to be split into batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputItem {
    pub path: PathBuf,
    pub size: u64,
    pub name: String,
}

impl InputItem {
    pub fn from_path(path: PathBuf) -> Result<Self, DiscoveryError> {
        let size = fs::metadata(&path)
            .map_err(|source| DiscoveryError::Read {
                path: path.clone(),
                source,
            })?
            .len();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self { path, size, name })
    }

    /// base name without its extension, used to name all outputs
    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }
}

/// Input collector variants, initialized from `Collector::load`
#[derive(Debug)]
pub enum Collector {
    /// recursive walk over a directory
    Directory { root: PathBuf, matcher: GlobMatcher },
    /// explicit list of files, one per line
    FileList {
        list: PathBuf,
        prefix: PathBuf,
        matcher: GlobMatcher,
    },
}

impl Collector {
    pub fn load(source: &InputSource, prefix: &Path) -> Result<Self, DiscoveryError> {
        let matcher = GlobBuilder::new(INPUT_GLOB)
            .case_insensitive(true)
            .build()?
            .compile_matcher();

        Ok(match source {
            InputSource::Directory(root) => Self::Directory {
                root: root.clone(),
                matcher,
            },
            InputSource::FileList(list) => Self::FileList {
                list: list.clone(),
                prefix: prefix.to_path_buf(),
                matcher,
            },
        })
    }

    /// Collect all eligible inputs in a stable order, failing if there are none
    #[tracing::instrument(level = "debug")]
    pub fn collect(&self) -> Result<Vec<InputItem>, DiscoveryError> {
        let inputs = match self {
            Self::Directory { root, matcher } => {
                let paths = WalkBuilder::new(root)
                    .standard_filters(false)
                    .build()
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry),
                        Err(error) => {
                            warn!(error = %error, "Failed to walk input directory entry");
                            None
                        }
                    })
                    .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
                    .map(DirEntry::into_path)
                    .filter(|path| is_match(matcher, path))
                    .sorted()
                    .collect_vec();

                paths
                    .into_iter()
                    .map(InputItem::from_path)
                    .collect::<Result<Vec<_>, _>>()?
            }
            Self::FileList {
                list,
                prefix,
                matcher,
            } => {
                let text = fs::read_to_string(list).map_err(|source| DiscoveryError::Read {
                    path: list.clone(),
                    source,
                })?;

                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter(|line| {
                        let inside = Path::new(line).starts_with(prefix);
                        if !inside {
                            warn!(
                                "Input data {line} not in {}, ignored",
                                prefix.display()
                            );
                        }
                        inside
                    })
                    .map(PathBuf::from)
                    .filter(|path| {
                        let eligible = path.is_file() && is_match(matcher, path);
                        if !eligible {
                            debug!(path = ?path, "Skipping missing or non .stdhep input");
                        }
                        eligible
                    })
                    .unique()
                    .map(InputItem::from_path)
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        if inputs.is_empty() {
            Err(DiscoveryError::NoInputs(match self {
                Self::Directory { root, .. } => root.clone(),
                Self::FileList { list, .. } => list.clone(),
            }))
        } else {
            info!("There are {} input .stdhep files to be processed", inputs.len());

            Ok(inputs)
        }
    }
}

fn is_match(matcher: &GlobMatcher, path: &Path) -> bool {
    path.file_name()
        .map_or(false, |name| matcher.is_match(Path::new(name)))
}
