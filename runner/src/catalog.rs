pub mod exec;
pub mod memory;

use crate::{
    config::CatalogConfig,
    retry::{RetriesExhausted, RetryPolicy},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Failed to query {lfn} in the catalog: {source}")]
    Query {
        lfn: String,
        source: RetriesExhausted<String>,
    },
    #[error("Failed to remove {lfn} from the catalog: {source}")]
    Removal {
        lfn: String,
        source: RetriesExhausted<String>,
    },
    #[error("Failed to add {lfn} to the catalog: {source}")]
    Add {
        lfn: String,
        source: RetriesExhausted<String>,
    },
}

/// Record stored for a logical file name
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub pfn: String,
    pub size: u64,
    pub storage_element: String,
    pub guid: String,
    pub checksum: String,
}

impl FileMetadata {
    /// metadata of a file known only by size, with a fresh GUID
    pub fn new(size: u64, storage_element: &str) -> Self {
        Self {
            pfn: String::new(),
            size,
            storage_element: storage_element.to_string(),
            guid: Uuid::new_v4().to_string().to_uppercase(),
            checksum: String::new(),
        }
    }
}

/// Reply of a catalog call: overall status plus per-name outcome
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogResponse {
    pub ok: bool,
    #[serde(default)]
    pub successful: BTreeMap<String, bool>,
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl CatalogResponse {
    pub fn success(lfn: &str, value: bool) -> Self {
        Self {
            ok: true,
            successful: BTreeMap::from([(lfn.to_string(), value)]),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// outcome for `lfn`, an error if the call or this name failed
    pub fn outcome(&self, lfn: &str) -> Result<bool, String> {
        if !self.ok {
            return Err(self
                .message
                .clone()
                .unwrap_or_else(|| "catalog call failed".to_string()));
        }

        match (self.successful.get(lfn), self.failed.get(lfn)) {
            (Some(value), _) => Ok(*value),
            (None, Some(reason)) => Err(reason.clone()),
            (None, None) => Err(format!("no result for {lfn}")),
        }
    }
}

/// External file catalog, addressed by logical file name
pub trait Catalog {
    fn is_file(&self, lfn: &str) -> CatalogResponse;
    fn remove(&self, lfn: &str) -> CatalogResponse;
    fn add(&self, lfn: &str, metadata: &FileMetadata) -> CatalogResponse;
}

impl<C: Catalog + ?Sized> Catalog for &C {
    fn is_file(&self, lfn: &str) -> CatalogResponse {
        (**self).is_file(lfn)
    }

    fn remove(&self, lfn: &str) -> CatalogResponse {
        (**self).remove(lfn)
    }

    fn add(&self, lfn: &str, metadata: &FileMetadata) -> CatalogResponse {
        (**self).add(lfn, metadata)
    }
}

/// All catalog backends, see `Catalogs::load`
#[derive(Debug)]
pub enum Catalogs {
    Memory(memory::MemoryCatalog),
    Exec(exec::ExecCatalog),
}

impl Catalogs {
    pub fn load(config: &CatalogConfig) -> Self {
        match config {
            CatalogConfig::Memory => Self::Memory(memory::MemoryCatalog::new()),
            CatalogConfig::Exec { exec, timeout_ms } => {
                Self::Exec(exec::ExecCatalog::new(exec.clone(), *timeout_ms))
            }
        }
    }
}

impl Catalog for Catalogs {
    fn is_file(&self, lfn: &str) -> CatalogResponse {
        match self {
            Self::Memory(catalog) => catalog.is_file(lfn),
            Self::Exec(catalog) => catalog.is_file(lfn),
        }
    }

    fn remove(&self, lfn: &str) -> CatalogResponse {
        match self {
            Self::Memory(catalog) => catalog.remove(lfn),
            Self::Exec(catalog) => catalog.remove(lfn),
        }
    }

    fn add(&self, lfn: &str, metadata: &FileMetadata) -> CatalogResponse {
        match self {
            Self::Memory(catalog) => catalog.add(lfn, metadata),
            Self::Exec(catalog) => catalog.add(lfn, metadata),
        }
    }
}

/// Outcome of a successful duplicate cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleanup {
    pub was_registered: bool,
    pub removed: bool,
}

/// Idempotent register/replace on top of a `Catalog`.
///
/// Every catalog call is retried according to the policy. After a successful
/// `register` exactly one record exists for the name, holding the new metadata.
/// After a failure the state is unknown.
#[derive(Debug)]
pub struct CatalogRegistrar<C> {
    catalog: C,
    policy: RetryPolicy,
}

impl<C: Catalog> CatalogRegistrar<C> {
    pub fn new(catalog: C, policy: RetryPolicy) -> Self {
        Self { catalog, policy }
    }

    pub fn is_registered(&self, lfn: &str) -> Result<bool, CatalogError> {
        self.policy
            .run(|_| self.catalog.is_file(lfn).outcome(lfn))
            .map_err(|source| CatalogError::Query {
                lfn: lfn.to_string(),
                source,
            })
    }

    fn remove(&self, lfn: &str) -> Result<(), CatalogError> {
        self.policy
            .run(|_| match self.catalog.remove(lfn).outcome(lfn) {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("{lfn} was not removed")),
                Err(error) => Err(error),
            })
            .map_err(|source| CatalogError::Removal {
                lfn: lfn.to_string(),
                source,
            })
    }

    /// Remove a stale record for `lfn` if one exists
    pub fn cleanup(&self, lfn: &str) -> Result<Cleanup, CatalogError> {
        if self.is_registered(lfn)? {
            self.remove(lfn)?;
            info!("{lfn} is removed from the catalog");

            Ok(Cleanup {
                was_registered: true,
                removed: true,
            })
        } else {
            debug!("{lfn} is not registered, nothing to do");

            Ok(Cleanup {
                was_registered: false,
                removed: false,
            })
        }
    }

    /// Register `lfn`, replacing whatever record was there before
    #[tracing::instrument(level = "debug", skip(self, metadata))]
    pub fn register(&self, lfn: &str, metadata: &FileMetadata) -> Result<Cleanup, CatalogError> {
        let cleanup = self.cleanup(lfn)?;

        self.policy
            .run(|_| match self.catalog.add(lfn, metadata).outcome(lfn) {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("Failed to add file {lfn}")),
                Err(error) => Err(error),
            })
            .map_err(|source| {
                warn!(lfn = lfn, error = %source, "Registration failed, catalog state unknown");

                CatalogError::Add {
                    lfn: lfn.to_string(),
                    source,
                }
            })?;

        Ok(cleanup)
    }
}
