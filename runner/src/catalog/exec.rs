use super::{Catalog, CatalogResponse, FileMetadata};
use crate::command::run_with_input;
use std::{path::PathBuf, time::Duration};
use tracing::{debug, error};

/// Catalog reached through an external command.
///
/// Invoked as `<exec> is-file|remove|add <lfn>`; `add` receives the metadata
/// as YAML on stdin. The command prints a `CatalogResponse` as YAML.
#[derive(Debug, Clone)]
pub struct ExecCatalog {
    exec: PathBuf,
    timeout: Duration,
}

impl ExecCatalog {
    pub fn new(exec: PathBuf, timeout_ms: u64) -> Self {
        Self {
            exec,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn call(&self, operation: &str, lfn: &str, input: &str) -> CatalogResponse {
        let output = match run_with_input(&self.exec, [operation, lfn], input, self.timeout) {
            Ok(output) => output,
            Err(error) => {
                error!(error = %error, operation = operation, "Catalog command failed");

                return CatalogResponse::error(error.to_string());
            }
        };

        debug!("Output from catalog command: {output}");

        serde_yaml::from_str::<CatalogResponse>(&output).unwrap_or_else(|error| {
            error!(error = %error, "Catalog command printed an unreadable response");

            CatalogResponse::error(format!("unreadable catalog response: {error}"))
        })
    }
}

impl Catalog for ExecCatalog {
    fn is_file(&self, lfn: &str) -> CatalogResponse {
        self.call("is-file", lfn, "")
    }

    fn remove(&self, lfn: &str) -> CatalogResponse {
        self.call("remove", lfn, "")
    }

    fn add(&self, lfn: &str, metadata: &FileMetadata) -> CatalogResponse {
        match serde_yaml::to_string(metadata) {
            Ok(input) => self.call("add", lfn, &input),
            Err(error) => CatalogResponse::error(error.to_string()),
        }
    }
}
