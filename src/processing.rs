//! Pair Processing
//!
//! The consumer hands every completed pair to a [`PairProcessor`]: two
//! source paths in, zero or more result paths out. The processor is an
//! external collaborator; the session only cares about the paths it returns.
//!
//! [`CommandProcessor`] runs a configured program once per pair and then
//! collects `<stem>_ir.*` and `<stem>_vis.*` from its output directory.

use crate::config::ProcessorConfig;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{error, info};

/// Errors reported by a processor.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The processing program could not be started
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The processing program exited unsuccessfully
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// Processing finished but produced nothing
    #[error("no result images produced for {0}")]
    NoOutputs(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns a received pair into result files.
///
/// Called once per completed pair, from a blocking thread.
pub trait PairProcessor: Send + Sync {
    fn process(&self, visible: &Path, thermal: &Path) -> Result<Vec<PathBuf>, ProcessingError>;
}

impl<F> PairProcessor for F
where
    F: Fn(&Path, &Path) -> Result<Vec<PathBuf>, ProcessingError> + Send + Sync,
{
    fn process(&self, visible: &Path, thermal: &Path) -> Result<Vec<PathBuf>, ProcessingError> {
        self(visible, thermal)
    }
}

/// A processor that produces no results. Used when nothing is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProcessor;

impl PairProcessor for NoopProcessor {
    fn process(&self, _visible: &Path, _thermal: &Path) -> Result<Vec<PathBuf>, ProcessingError> {
        Ok(Vec::new())
    }
}

/// Runs an external program for every pair.
///
/// Arguments may contain the placeholders `{visible}`, `{thermal}` and
/// `{output_dir}`.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            output_dir: output_dir.into(),
        }
    }

    pub fn from_config(config: &ProcessorConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self::new(config.program.clone(), config.args.clone(), output_dir)
    }

    /// Expands the argument templates for one pair.
    pub fn render_args(&self, visible: &Path, thermal: &Path) -> Vec<String> {
        let visible = visible.to_string_lossy();
        let thermal = thermal.to_string_lossy();
        let output_dir = self.output_dir.to_string_lossy();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{visible}", &visible)
                    .replace("{thermal}", &thermal)
                    .replace("{output_dir}", &output_dir)
            })
            .collect()
    }
}

impl PairProcessor for CommandProcessor {
    fn process(&self, visible: &Path, thermal: &Path) -> Result<Vec<PathBuf>, ProcessingError> {
        std::fs::create_dir_all(&self.output_dir)?;

        let args = self.render_args(visible, thermal);
        info!(program = %self.program, args = ?args, "Running processor");

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| ProcessingError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(program = %self.program, status = %output.status, "Processor failed");
            return Err(ProcessingError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr,
            });
        }

        let stem = file_stem(visible);
        let results = find_results(&self.output_dir, &stem)?;
        if results.is_empty() {
            return Err(ProcessingError::NoOutputs(stem));
        }

        info!(results = ?results, "Processor produced results");
        Ok(results)
    }
}

/// The file name without its extension.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Locates `<stem>_ir.*` and `<stem>_vis.*` in `dir`, infrared first.
///
/// At most one file is returned per suffix.
pub fn find_results(dir: &Path, stem: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut results = Vec::new();

    for suffix in ["ir", "vis"] {
        let prefix = format!("{}_{}.", stem, suffix);
        let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
            .map(|entry| entry.path())
            .collect();

        matches.sort();
        if let Some(first) = matches.into_iter().next() {
            results.push(first);
        }
    }

    Ok(results)
}
