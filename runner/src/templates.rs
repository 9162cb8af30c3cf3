use std::{
    fs,
    io::Error,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};
use quick_xml::{
    events::{BytesStart, BytesText, Event},
    Reader, Writer,
};

pub const EVENT_MACRO: &str = "event.macro";
pub const SIMU_MACRO: &str = "simu.macro";
pub const RECO_XML: &str = "reco.xml";
pub const PANDORA_SETTINGS: &str = "PandoraSettingsDefault.xml";
pub const PANDORA_LIKELIHOOD: &str = "PandoraLikelihoodData9EBin.xml";

pub const GENERATOR: &str = "/generator/generator";
pub const BEAM_ON: &str = "/run/beamOn";
pub const DB_HOST: &str = "/Mokka/init/dbHost";
pub const INITIAL_MACRO: &str = "/Mokka/init/initialMacroFile";
pub const START_EVENT: &str = "/Mokka/init/startEventNumber";
pub const LCIO_FILENAME: &str = "/Mokka/init/lcioFilename";
pub const RANDOM_SEED: &str = "/Mokka/init/randomSeed";

pub const HISTOGRAM_FILE: &str = "algorithm/HistogramFile";
pub const PANDORA_SETTINGS_PARAMETER: &str =
    r#"processor/parameter[@name="PandoraSettingsXmlFile"]"#;
pub const LCIO_INPUT_FILES: &str = r#"global/parameter[@name="LCIOInputFiles"]"#;
pub const LCIO_OUTPUT_FILE: &str =
    r#"processor[@name="MyLCIOOutputProcessor"]/parameter[@name="LCIOOutputFile"]"#;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template {path}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: Error },
    #[error("Template {name} is not valid XML: {message}")]
    Xml { name: String, message: String },
}

/// The three mutable templates of a run, loaded and normalized once
#[derive(Debug, Clone)]
pub struct TemplateStore {
    pub event_macro: Vec<String>,
    pub simu_macro: Vec<String>,
    /// reconstruction descriptor, already pointed at the local Pandora settings
    pub reco_xml: String,
    pandora_settings: Option<String>,
    likelihood: Option<PathBuf>,
}

impl TemplateStore {
    /// Load `event.macro`, `simu.macro`, `reco.xml` and the Pandora files from `work_dir`
    pub fn load(work_dir: &Path, db_host: &str) -> Result<Self, TemplateError> {
        let mut store = Self::from_parts(
            &read(&work_dir.join(EVENT_MACRO))?,
            &read(&work_dir.join(SIMU_MACRO))?,
            &read(&work_dir.join(RECO_XML))?,
            db_host,
        )?;

        store.pandora_settings = Some(rewrite_xml(
            PANDORA_SETTINGS,
            &read(&work_dir.join(PANDORA_SETTINGS))?,
            &[(HISTOGRAM_FILE, PANDORA_LIKELIHOOD)],
        )?);
        store.likelihood = Some(work_dir.join(PANDORA_LIKELIHOOD));

        info!(work_dir = ?work_dir, "Loaded templates");

        Ok(store)
    }

    /// Build from template text, without the shared Pandora files
    pub fn from_parts(
        event_macro: &str,
        simu_macro: &str,
        reco_xml: &str,
        db_host: &str,
    ) -> Result<Self, TemplateError> {
        Ok(Self {
            event_macro: macro_lines(event_macro).map(str::to_string).collect(),
            simu_macro: normalize_simu_macro(simu_macro, db_host),
            reco_xml: rewrite_xml(
                RECO_XML,
                reco_xml,
                &[(PANDORA_SETTINGS_PARAMETER, PANDORA_SETTINGS)],
            )?,
            pandora_settings: None,
            likelihood: None,
        })
    }

    /// Write the Pandora settings and copy the likelihood data into the master directory.
    /// These are shared by every job of the run.
    pub fn install_shared(&self, master: &Path) -> Result<Vec<PathBuf>, TemplateError> {
        let mut installed = Vec::new();

        if let Some(likelihood) = &self.likelihood {
            let target = master.join(PANDORA_LIKELIHOOD);
            fs::copy(likelihood, &target).map_err(|source| TemplateError::Write {
                path: target.clone(),
                source,
            })?;
            installed.push(target);
        }

        if let Some(settings) = &self.pandora_settings {
            let target = master.join(PANDORA_SETTINGS);
            fs::write(&target, settings).map_err(|source| TemplateError::Write {
                path: target.clone(),
                source,
            })?;
            installed.push(target);
        }

        debug!(installed = ?installed, "Installed shared reconstruction files");

        Ok(installed)
    }
}

fn read(path: &Path) -> Result<String, TemplateError> {
    fs::read_to_string(path).map_err(|source| TemplateError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// left trimmed lines without blanks and `#` comments
fn macro_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim_start)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Force the database host, the initial macro and a start event of 0.
/// A missing start event directive goes right after the initial macro (or last).
fn normalize_simu_macro(text: &str, db_host: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut anchor = None;
    let mut has_start_event = false;

    for line in macro_lines(text) {
        if line.starts_with(DB_HOST) {
            lines.push(format!("{DB_HOST} {db_host}"));
        } else if line.starts_with(INITIAL_MACRO) {
            lines.push(format!("{INITIAL_MACRO} {EVENT_MACRO}"));
            anchor = Some(lines.len());
        } else if line.starts_with(START_EVENT) {
            lines.push(format!("{START_EVENT} 0"));
            has_start_event = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !has_start_event {
        lines.insert(anchor.unwrap_or(lines.len()), format!("{START_EVENT} 0"));
    }

    lines
}

/// Put `seed` into a simulation macro, replacing existing seed lines or inserting
/// one before the database host directive. `None` if neither is present.
pub fn inject_seed(text: &str, seed: u64) -> Option<String> {
    let seed_line = format!("{RANDOM_SEED} {seed}");
    let has_seed = text.lines().any(|line| line.starts_with(RANDOM_SEED));
    let has_anchor = text.lines().any(|line| line.starts_with(DB_HOST));

    if !has_seed && !has_anchor {
        return None;
    }

    let mut output = String::with_capacity(text.len() + seed_line.len() + 1);
    for line in text.lines() {
        if has_seed && line.starts_with(RANDOM_SEED) {
            output.push_str(&seed_line);
        } else {
            if !has_seed && line.starts_with(DB_HOST) {
                output.push_str(&seed_line);
                output.push('\n');
            }
            output.push_str(line);
        }
        output.push('\n');
    }

    Some(output)
}

/// `name` or `name[@attribute="value"]`
#[derive(Debug, PartialEq, Eq)]
struct Step<'a> {
    name: &'a str,
    attribute: Option<(&'a str, &'a str)>,
}

impl<'a> Step<'a> {
    fn parse(segment: &'a str) -> Self {
        match segment.split_once("[@") {
            Some((name, predicate)) => {
                let predicate = predicate.trim_end_matches(']');
                let (key, value) = predicate.split_once('=').unwrap_or((predicate, ""));

                Self {
                    name,
                    attribute: Some((key, value.trim_matches('"'))),
                }
            }
            None => Self {
                name: segment,
                attribute: None,
            },
        }
    }

    fn matches(&self, element: &BytesStart) -> bool {
        element.name().as_ref() == self.name.as_bytes()
            && self.attribute.map_or(true, |(key, value)| {
                element
                    .try_get_attribute(key)
                    .ok()
                    .flatten()
                    .and_then(|attribute| attribute.unescape_value().ok())
                    .map_or(false, |found| found == value)
            })
    }
}

/// An open element while streaming a document
struct Frame<'a> {
    depth: usize,
    /// edits whose path matched every element from the root down to here
    partial: Vec<usize>,
    /// text for this element when it is the target of an edit
    replacement: Option<&'a str>,
}

impl<'a> Frame<'a> {
    fn enter(edits: &[(Vec<Step>, &'a str)], parent: Option<&Frame>, element: &BytesStart) -> Self {
        let Some(parent) = parent else {
            return Self {
                depth: 0,
                partial: (0..edits.len()).collect(),
                replacement: None,
            };
        };

        let depth = parent.depth + 1;
        let mut partial = Vec::new();
        let mut replacement = None;
        for &edit in &parent.partial {
            let (steps, text) = &edits[edit];
            if !steps[depth - 1].matches(element) {
                continue;
            }
            if steps.len() == depth {
                replacement = Some(*text);
            } else {
                partial.push(edit);
            }
        }

        Self {
            depth,
            partial,
            replacement,
        }
    }
}

/// Replace the text of every element matching one of the `edits`, each a path
/// relative to the root element and the new text. Everything else, including
/// comments, declarations and attribute spelling, is written back as read.
pub fn rewrite_xml(name: &str, text: &str, edits: &[(&str, &str)]) -> Result<String, TemplateError> {
    let edits = edits
        .iter()
        .map(|(path, text)| (path.split('/').map(Step::parse).collect::<Vec<_>>(), *text))
        .collect::<Vec<_>>();
    let invalid = |message: String| TemplateError::Xml {
        name: name.to_string(),
        message,
    };

    let mut reader = Reader::from_str(text);
    let mut writer = Writer::new(Vec::with_capacity(text.len()));
    let mut open: Vec<Frame> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|error| invalid(format!("{error} at byte {}", reader.buffer_position())))?;

        let written = match event {
            Event::Eof => break,
            Event::Start(start) => {
                let frame = Frame::enter(&edits, open.last(), &start);
                let replacement = frame.replacement;
                open.push(frame);

                writer.write_event(Event::Start(start)).and_then(|_| match replacement {
                    Some(text) => writer.write_event(Event::Text(BytesText::new(text))),
                    None => Ok(()),
                })
            }
            Event::Empty(start) => match Frame::enter(&edits, open.last(), &start).replacement {
                Some(text) => {
                    let end = start.to_end().into_owned();
                    writer
                        .write_event(Event::Start(start))
                        .and_then(|_| writer.write_event(Event::Text(BytesText::new(text))))
                        .and_then(|_| writer.write_event(Event::End(end)))
                }
                None => writer.write_event(Event::Empty(start)),
            },
            Event::End(end) => {
                open.pop();
                writer.write_event(Event::End(end))
            }
            // old text of a rewritten element
            Event::Text(_) | Event::CData(_)
                if open.last().map_or(false, |frame| frame.replacement.is_some()) =>
            {
                Ok(())
            }
            other => writer.write_event(other),
        };
        written.map_err(|error| invalid(error.to_string()))?;
    }

    if !open.is_empty() {
        return Err(invalid(format!("{} element(s) left open", open.len())));
    }

    String::from_utf8(writer.into_inner()).map_err(|error| invalid(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMU: &str = "# Mokka steering\n\
/Mokka/init/detectorModel CEPC_v1\n\
   /Mokka/init/dbHost localhost\n\
\n\
/Mokka/init/initialMacroFile other.macro\n\
/Mokka/init/lcioFilename out.slcio\n";

    const RECO: &str = r#"<marlin>
  <global>
    <parameter name="LCIOInputFiles">in.slcio</parameter>
  </global>
  <processor name="MyMarlinArbor" type="MarlinArbor">
    <parameter name="PandoraSettingsXmlFile">/abs/settings.xml</parameter>
  </processor>
  <processor name="MyLCIOOutputProcessor" type="LCIOOutputProcessor">
    <parameter name="LCIOOutputFile" type="string">out.slcio</parameter>
  </processor>
</marlin>"#;

    #[test]
    fn normalizes_simulation_macro() {
        let lines = normalize_simu_macro(SIMU, "202.114.78.211");

        assert_eq!(
            lines,
            vec![
                "/Mokka/init/detectorModel CEPC_v1",
                "/Mokka/init/dbHost 202.114.78.211",
                "/Mokka/init/initialMacroFile event.macro",
                "/Mokka/init/startEventNumber 0",
                "/Mokka/init/lcioFilename out.slcio",
            ]
        );
    }

    #[test]
    fn keeps_existing_start_event_position() {
        let lines = normalize_simu_macro(
            "/Mokka/init/startEventNumber 7\n/Mokka/init/initialMacroFile x\n",
            "db",
        );

        assert_eq!(
            lines,
            vec![
                "/Mokka/init/startEventNumber 0",
                "/Mokka/init/initialMacroFile event.macro"
            ]
        );
    }

    #[test]
    fn seed_is_replaced_or_inserted_before_db_host() {
        assert_eq!(
            inject_seed("a\n/Mokka/init/randomSeed 1\n/Mokka/init/dbHost h\n", 42).as_deref(),
            Some("a\n/Mokka/init/randomSeed 42\n/Mokka/init/dbHost h\n")
        );
        assert_eq!(
            inject_seed("a\n/Mokka/init/dbHost h\n", 42).as_deref(),
            Some("a\n/Mokka/init/randomSeed 42\n/Mokka/init/dbHost h\n")
        );
        assert_eq!(inject_seed("a\nb\n", 42), None);
    }

    const MARLIN: &str = r#"<?xml version="1.0" encoding="us-ascii"?>
<!-- ?xml-stylesheet type="text/xsl" href="http://ilcsoft.desy.de/marlin/marlin.xsl"? -->
<marlin xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:noNamespaceSchemaLocation="http://ilcsoft.desy.de/marlin/marlin.xsd">
  <execute>
    <processor name="MyMarlinArbor"/>
    <processor name="MyLCIOOutputProcessor"/>
  </execute>

  <global>
    <parameter name="LCIOInputFiles"> in.slcio </parameter>
    <parameter name="MaxRecordNumber" value="0" />
    <parameter name="Verbosity" options="DEBUG0-4,MESSAGE0-4,WARNING0-4,ERROR0-4,SILENT"> MESSAGE  </parameter>
  </global>

  <processor name="MyMarlinArbor" type="MarlinArbor">
    <!--Pandora settings, resolved next to the job-->
    <parameter name="PandoraSettingsXmlFile" type="String">/abs/settings.xml</parameter>
    <parameter name="CollectionName" type="StringVec" lcioInType="Track">MarlinTrkTracks &amp; more</parameter>
  </processor>

  <processor name="MyLCIOOutputProcessor" type="LCIOOutputProcessor">
    <parameter name="LCIOOutputFile" type="string" >out.slcio</parameter>
    <parameter name="LCIOWriteMode" type="string" value="WRITE_NEW"/>
  </processor>
</marlin>
"#;

    #[test]
    fn untouched_content_is_written_back_as_read() {
        let rendered = rewrite_xml(
            RECO_XML,
            MARLIN,
            &[
                (LCIO_INPUT_FILES, "zh_sim.slcio"),
                (LCIO_OUTPUT_FILE, "zh_rec.slcio"),
            ],
        )
        .unwrap();

        assert_eq!(
            rendered,
            MARLIN
                .replace("> in.slcio <", ">zh_sim.slcio<")
                .replace(">out.slcio<", ">zh_rec.slcio<")
        );
    }

    #[test]
    fn unmatched_paths_change_nothing() {
        let rendered = rewrite_xml(
            RECO_XML,
            MARLIN,
            &[(r#"processor/parameter[@name="Nope"]"#, "x")],
        )
        .unwrap();

        assert_eq!(rendered, MARLIN);
    }

    #[test]
    fn empty_elements_get_their_text() {
        let rendered = rewrite_xml(
            PANDORA_SETTINGS,
            r#"<pandora><algorithm type="Likelihood"><HistogramFile/></algorithm><HistogramFile>top</HistogramFile></pandora>"#,
            &[(HISTOGRAM_FILE, PANDORA_LIKELIHOOD)],
        )
        .unwrap();

        assert_eq!(
            rendered,
            r#"<pandora><algorithm type="Likelihood"><HistogramFile>PandoraLikelihoodData9EBin.xml</HistogramFile></algorithm><HistogramFile>top</HistogramFile></pandora>"#
        );
    }

    #[test]
    fn replacement_text_is_escaped() {
        let rendered = rewrite_xml(
            RECO_XML,
            RECO,
            &[(LCIO_OUTPUT_FILE, "a<b&c.slcio")],
        )
        .unwrap();

        assert!(rendered.contains(r#"type="string">a&lt;b&amp;c.slcio</parameter>"#));
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(matches!(
            rewrite_xml(RECO_XML, "<marlin><global></marlin>", &[]),
            Err(TemplateError::Xml { .. })
        ));
        assert!(matches!(
            rewrite_xml(RECO_XML, "<marlin><global>", &[]),
            Err(TemplateError::Xml { .. })
        ));
    }

    #[test]
    fn store_points_reconstruction_at_local_settings() {
        let store = TemplateStore::from_parts("/run/beamOn 1\n", SIMU, MARLIN, "db").unwrap();

        assert_eq!(
            store.reco_xml,
            MARLIN.replace("/abs/settings.xml", PANDORA_SETTINGS)
        );
    }

    #[test]
    fn step_parsing() {
        assert_eq!(
            Step::parse(r#"parameter[@name="LCIOOutputFile"]"#),
            Step {
                name: "parameter",
                attribute: Some(("name", "LCIOOutputFile"))
            }
        );
        assert_eq!(
            Step::parse("global"),
            Step {
                name: "global",
                attribute: None
            }
        );
    }
}
