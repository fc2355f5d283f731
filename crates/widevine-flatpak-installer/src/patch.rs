use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::extract::{error_chain_has_not_found, run_command};
use crate::fs_utils::remove_file_if_exists;

/// Rewrites the CDM library so it loads under the host page size.
///
/// Implementations must write `output` and return `Ok` only on success; the
/// caller treats any error as fatal.
pub trait LibraryTransformer {
    fn transform(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Runs `<program> <input> <output>` and treats exit status 0 as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessTransformer {
    program: String,
}

impl SubprocessTransformer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub(crate) fn build_command(&self, input: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.arg(input).arg(output);
        command
    }
}

impl LibraryTransformer for SubprocessTransformer {
    fn transform(&self, input: &Path, output: &Path) -> Result<()> {
        let mut command = self.build_command(input, output);
        debug!(command = ?command, "patching library");
        let context = format!("'{}' failed", self.program);
        run_command(&mut command, &context).map_err(|err| {
            if error_chain_has_not_found(&err) {
                return anyhow!("patcher '{}' was not found on PATH", self.program);
            }
            err
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedLibrary {
    pub path: PathBuf,
    pub len: u64,
}

pub fn patch_library(
    transformer: &dyn LibraryTransformer,
    input: &Path,
    output: &Path,
) -> Result<PatchedLibrary> {
    remove_file_if_exists(output)
        .with_context(|| format!("failed to clear stale patch output {}", output.display()))?;

    transformer.transform(input, output)?;

    let metadata = match fs::metadata(output) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(anyhow!(
                "patcher reported success but wrote no output at {}",
                output.display()
            ));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", output.display()));
        }
    };
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(anyhow!(
            "patcher output is empty or not a regular file: {}",
            output.display()
        ));
    }

    Ok(PatchedLibrary {
        path: output.to_path_buf(),
        len: metadata.len(),
    })
}
