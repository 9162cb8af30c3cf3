use crate::{
    planner::BatchDescriptor,
    templates::{
        inject_seed, rewrite_xml, TemplateError, TemplateStore, BEAM_ON, EVENT_MACRO,
        GENERATOR, LCIO_FILENAME, LCIO_INPUT_FILES, LCIO_OUTPUT_FILE, RECO_XML, SIMU_MACRO,
        START_EVENT,
    },
};
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Everything a batch contributes to its artifacts
#[derive(Debug, Clone)]
pub struct ArtifactContext<'a> {
    /// file name of the input as staged next to the job
    pub input_name: &'a str,
    /// input base name without extension
    pub stem: &'a str,
    pub batch: &'a BatchDescriptor,
    pub events: u64,
    pub seed: Option<u64>,
}

impl ArtifactContext<'_> {
    pub fn sim_file(&self) -> String {
        format!("{}_sim{}.slcio", self.stem, self.batch.label)
    }

    pub fn rec_file(&self) -> String {
        format!("{}_rec{}.slcio", self.stem, self.batch.label)
    }
}

/// Generated descriptors of one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub event_macro: String,
    pub simu_macro: String,
    pub reco_xml: String,
}

/// Where an `ArtifactSet` was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub event_macro: PathBuf,
    pub simu_macro: PathBuf,
    pub reco_xml: PathBuf,
}

impl TemplateStore {
    /// Derive the artifacts of one batch. Lines and elements not addressed here are
    /// copied unchanged and in order; the result only depends on the templates and `context`.
    pub fn render(&self, context: &ArtifactContext) -> Result<ArtifactSet, TemplateError> {
        let event_macro = render_lines(&self.event_macro, |line| {
            if line.starts_with(GENERATOR) {
                Some(format!("{GENERATOR} {}", context.input_name))
            } else if line.starts_with(BEAM_ON) {
                Some(format!("{BEAM_ON} {}", context.events))
            } else {
                None
            }
        });

        let mut simu_macro = render_lines(&self.simu_macro, |line| {
            if line.starts_with(LCIO_FILENAME) {
                Some(format!("{LCIO_FILENAME} {}", context.sim_file()))
            } else if line.starts_with(START_EVENT) {
                Some(format!("{START_EVENT} {}", context.batch.start_event))
            } else {
                None
            }
        });

        if let Some(seed) = context.seed {
            match inject_seed(&simu_macro, seed) {
                Some(seeded) => simu_macro = seeded,
                None => warn!("Simulation template has neither a seed nor a dbHost directive, seed {seed} not set"),
            }
        }

        let (sim_file, rec_file) = (context.sim_file(), context.rec_file());
        let reco_xml = rewrite_xml(
            RECO_XML,
            &self.reco_xml,
            &[
                (LCIO_INPUT_FILES, sim_file.as_str()),
                (LCIO_OUTPUT_FILE, rec_file.as_str()),
            ],
        )?;

        Ok(ArtifactSet {
            event_macro,
            simu_macro,
            reco_xml,
        })
    }
}

impl ArtifactSet {
    /// Write all descriptors into `dir`, refusing to touch existing files
    pub fn write(&self, dir: &Path) -> Result<ArtifactPaths, TemplateError> {
        let paths = ArtifactPaths {
            event_macro: dir.join(EVENT_MACRO),
            simu_macro: dir.join(SIMU_MACRO),
            reco_xml: dir.join(RECO_XML),
        };

        write_once(&paths.event_macro, &self.event_macro)?;
        write_once(&paths.simu_macro, &self.simu_macro)?;
        write_once(&paths.reco_xml, &self.reco_xml)?;
        debug!(dir = ?dir, "Wrote artifact set");

        Ok(paths)
    }
}

/// Create `path` with `contents`, failing if it already exists
pub fn write_once(path: &Path, contents: &str) -> Result<(), TemplateError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut file| file.write_all(contents.as_bytes()))
        .map_err(|source| TemplateError::Write {
            path: path.to_path_buf(),
            source,
        })
}

fn render_lines<F>(lines: &[String], mut rewrite: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    lines.iter().fold(String::new(), |mut output, line| {
        match rewrite(line) {
            Some(replacement) => output.push_str(&replacement),
            None => output.push_str(line),
        }
        output.push('\n');
        output
    })
}
