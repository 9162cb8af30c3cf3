use super::{Catalog, CatalogResponse, FileMetadata};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Query,
    Remove,
    Add,
}

/// In-process catalog used for dry runs and tests.
/// Failures can be injected per operation to exercise retries.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: Mutex<BTreeMap<String, FileMetadata>>,
    failures: Mutex<BTreeMap<Operation, u32>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// make the next `times` calls of `operation` fail
    pub fn fail_next(&self, operation: Operation, times: u32) {
        *self.failures.lock().entry(operation).or_default() += times;
    }

    pub fn get(&self, lfn: &str) -> Option<FileMetadata> {
        self.records.lock().get(lfn).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn injected_failure(&self, operation: Operation) -> Option<CatalogResponse> {
        let mut failures = self.failures.lock();

        match failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                debug!(operation = ?operation, "Injected catalog failure");

                Some(CatalogResponse::error(format!("injected {operation:?} failure")))
            }
            _ => None,
        }
    }
}

impl Catalog for MemoryCatalog {
    fn is_file(&self, lfn: &str) -> CatalogResponse {
        self.injected_failure(Operation::Query).unwrap_or_else(|| {
            CatalogResponse::success(lfn, self.records.lock().contains_key(lfn))
        })
    }

    fn remove(&self, lfn: &str) -> CatalogResponse {
        self.injected_failure(Operation::Remove).unwrap_or_else(|| {
            self.records.lock().remove(lfn);

            CatalogResponse::success(lfn, true)
        })
    }

    fn add(&self, lfn: &str, metadata: &FileMetadata) -> CatalogResponse {
        self.injected_failure(Operation::Add).unwrap_or_else(|| {
            let mut records = self.records.lock();

            if records.contains_key(lfn) {
                let mut response = CatalogResponse {
                    ok: true,
                    ..Default::default()
                };
                response
                    .failed
                    .insert(lfn.to_string(), "file already registered".to_string());

                response
            } else {
                records.insert(lfn.to_string(), metadata.clone());

                CatalogResponse::success(lfn, true)
            }
        })
    }
}
