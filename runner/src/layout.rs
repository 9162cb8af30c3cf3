use std::{
    fs,
    io::{Error, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

pub const REPOSITORY_DIR: &str = "repository";

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Master directory {0} already exists, please check it to avoid overwrite")]
    Collision(PathBuf),
    #[error("Failed to prepare {path}: {source}")]
    Io { path: PathBuf, source: Error },
}

/// Numbered directory tree holding all artifacts of one run
///
/// `<root>/repository/<N>/` with one unit directory `1`, `2`, ... per job.
#[derive(Debug)]
pub struct MasterRepository {
    path: PathBuf,
    next_unit: usize,
}

impl MasterRepository {
    /// Allocate `<root>/repository/<N>`, N being the number of entries already present.
    /// Never reuses an existing path.
    pub fn create(root: &Path) -> Result<Self, LayoutError> {
        let repository = root.join(REPOSITORY_DIR);

        if !repository.is_dir() {
            fs::create_dir(&repository).map_err(|source| LayoutError::Io {
                path: repository.clone(),
                source,
            })?;
        }

        let count = fs::read_dir(&repository)
            .map_err(|source| LayoutError::Io {
                path: repository.clone(),
                source,
            })?
            .count();
        let path = repository.join(count.to_string());

        // create_dir fails on an existing path, closing the gap between counting and creating
        match fs::create_dir(&path) {
            Ok(()) => {
                info!(path = ?path, "Created master directory");

                Ok(Self { path, next_unit: 1 })
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                Err(LayoutError::Collision(path))
            }
            Err(source) => Err(LayoutError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// numeric name of the master directory
    pub fn name(&self) -> String {
        file_name(&self.path)
    }

    /// Create the next sequentially numbered unit directory
    pub fn allocate_unit(&mut self) -> Result<UnitDirectory, LayoutError> {
        let index = self.next_unit;
        let path = self.path.join(index.to_string());

        fs::create_dir(&path).map_err(|source| match source.kind() {
            ErrorKind::AlreadyExists => LayoutError::Collision(path.clone()),
            _ => LayoutError::Io {
                path: path.clone(),
                source,
            },
        })?;
        self.next_unit += 1;

        Ok(UnitDirectory { index, path })
    }
}

/// Directory owning the artifact set of a single job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDirectory {
    pub index: usize,
    pub path: PathBuf,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
