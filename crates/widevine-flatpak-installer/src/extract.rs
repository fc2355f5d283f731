use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use widevine_flatpak_core::PayloadPaths;

/// Pulls the subtree matching `pattern` out of a filesystem image.
pub trait PayloadExtractor {
    fn extract(&self, image: &Path, pattern: &str, dest: &Path) -> Result<()>;
}

/// Extracts from squashfs images with `unsquashfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquashfsExtractor;

impl PayloadExtractor for SquashfsExtractor {
    fn extract(&self, image: &Path, pattern: &str, dest: &Path) -> Result<()> {
        extract_squashfs_with_runner(image, pattern, dest, run_command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPayload {
    pub root: PathBuf,
    pub library: PathBuf,
    pub manifest: PathBuf,
    pub license: PathBuf,
}

pub(crate) fn build_unsquashfs_command(image: &Path, pattern: &str, dest: &Path) -> Command {
    let mut command = Command::new("unsquashfs");
    command
        .arg("-q")
        .arg("-n")
        .arg("-f")
        .arg("-d")
        .arg(dest)
        .arg(image)
        .arg(pattern);
    command
}

pub(crate) fn extract_squashfs_with_runner<RunCommand>(
    image: &Path,
    pattern: &str,
    dest: &Path,
    mut run: RunCommand,
) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<()>,
{
    let mut command = build_unsquashfs_command(image, pattern, dest);
    debug!(command = ?command, "extracting payload");
    run(&mut command, "failed to extract squashfs image").map_err(|err| {
        if error_chain_has_not_found(&err) {
            return anyhow!(
                "failed to extract squashfs image: required tool 'unsquashfs' was not found on PATH; install squashfs-tools and retry. image={}",
                image.display()
            );
        }
        err
    })?;

    if !contains_any_file(dest)? {
        return Err(anyhow!(
            "extraction produced no files matching '{}' from {}",
            pattern,
            image.display()
        ));
    }
    Ok(())
}

/// Resolves the three payload files below `root`, failing on the first one
/// that is missing or not a regular file.
pub fn locate_payload(root: &Path, paths: &PayloadPaths) -> Result<ExtractedPayload> {
    let library = existing_file(root, &paths.library)?;
    let manifest = existing_file(root, &paths.manifest)?;
    let license = existing_file(root, &paths.license)?;
    Ok(ExtractedPayload {
        root: root.to_path_buf(),
        library,
        manifest,
        license,
    })
}

fn existing_file(root: &Path, rel: &Path) -> Result<PathBuf> {
    let path = root.join(rel);
    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(anyhow!(
                "expected payload file is missing: {}",
                rel.display()
            ));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if !metadata.is_file() {
        return Err(anyhow!(
            "expected payload entry is not a regular file: {}",
            rel.display()
        ));
    }
    Ok(path)
}

fn contains_any_file(dir: &Path) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("failed reading entry in {}", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to inspect {}", entry.path().display()))?;
        if file_type.is_dir() {
            if contains_any_file(&entry.path())? {
                return Ok(true);
            }
            continue;
        }
        return Ok(true);
    }
    Ok(false)
}

pub(crate) fn error_chain_has_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound)
    })
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    capture_command(command, context_message).map(|_| ())
}

/// Runs `command` to completion and returns its stdout on success.
pub fn capture_command(command: &mut Command, context_message: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
