use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::discovery::plan_discovery_links;
use crate::{InstallLayout, SandboxStore};

/// Problem found after installation. Never fatal: the files are already in
/// place when verification runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationWarning {
    MissingFile(PathBuf),
    NotALink(PathBuf),
    BrokenLink(PathBuf),
    ManifestUnreadable {
        path: PathBuf,
        detail: String,
    },
    ManifestVersionMismatch {
        expected: String,
        found: Option<String>,
    },
    OverrideQueryFailed(String),
    OverrideEnvMismatch {
        key: String,
        expected: String,
        found: Option<String>,
    },
    OverrideGrantMissing(PathBuf),
}

impl fmt::Display for VerificationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFile(path) => write!(f, "missing installed file: {}", path.display()),
            Self::NotALink(path) => write!(
                f,
                "discovery entry is not a symlink: {}",
                path.display()
            ),
            Self::BrokenLink(path) => write!(
                f,
                "discovery link does not resolve to the installed file: {}",
                path.display()
            ),
            Self::ManifestUnreadable { path, detail } => write!(
                f,
                "cannot read CDM manifest {}: {detail}",
                path.display()
            ),
            Self::ManifestVersionMismatch { expected, found } => match found {
                Some(found) => write!(
                    f,
                    "CDM manifest reports version {found}, expected {expected}"
                ),
                None => write!(f, "CDM manifest has no version, expected {expected}"),
            },
            Self::OverrideQueryFailed(detail) => {
                write!(f, "cannot read Flatpak overrides: {detail}")
            }
            Self::OverrideEnvMismatch {
                key,
                expected,
                found,
            } => match found {
                Some(found) => write!(f, "override {key}={found}, expected {expected}"),
                None => write!(f, "override {key} is not set, expected {expected}"),
            },
            Self::OverrideGrantMissing(path) => write!(
                f,
                "override does not grant read-only access to {}",
                path.display()
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CdmManifest {
    version: Option<String>,
}

/// Re-reads what the pipeline wrote and reports anything that looks off.
pub fn verify_installation(
    layout: &InstallLayout,
    sandbox: &dyn SandboxStore,
    app_id: &str,
    env_key: &str,
) -> Vec<VerificationWarning> {
    let mut warnings = Vec::new();

    for path in [
        layout.library_path(),
        layout.manifest_path(),
        layout.license_path(),
        layout.readme_path(),
        layout.pref_path(),
    ] {
        if !path.is_file() {
            warnings.push(VerificationWarning::MissingFile(path));
        }
    }

    let bundle_dir = layout.bundle_dir();
    for link in plan_discovery_links(layout) {
        let link_path = bundle_dir.join(&link.link);
        let expected = link.resolved().map(|rel| bundle_dir.join(rel));
        check_link(&link_path, expected, &mut warnings);
    }

    check_manifest(&layout.manifest_path(), layout.cdm_version(), &mut warnings);

    match sandbox.show(app_id) {
        Ok(overrides) => {
            let expected = layout.discovery_dir().display().to_string();
            let found = overrides.env(env_key);
            if found != Some(expected.as_str()) {
                warnings.push(VerificationWarning::OverrideEnvMismatch {
                    key: env_key.to_string(),
                    expected,
                    found: found.map(str::to_string),
                });
            }
            if !overrides.grants_read_only(&bundle_dir) {
                warnings.push(VerificationWarning::OverrideGrantMissing(bundle_dir.clone()));
            }
        }
        Err(err) => warnings.push(VerificationWarning::OverrideQueryFailed(format!("{err:#}"))),
    }

    for warning in &warnings {
        warn!("{warning}");
    }
    warnings
}

fn check_link(
    link_path: &Path,
    expected: Option<PathBuf>,
    warnings: &mut Vec<VerificationWarning>,
) {
    match fs::symlink_metadata(link_path) {
        Ok(metadata) if metadata.file_type().is_symlink() => {}
        Ok(_) => {
            warnings.push(VerificationWarning::NotALink(link_path.to_path_buf()));
            return;
        }
        Err(_) => {
            warnings.push(VerificationWarning::MissingFile(link_path.to_path_buf()));
            return;
        }
    }

    let resolves = match (fs::canonicalize(link_path), expected.map(fs::canonicalize)) {
        (Ok(actual), Some(Ok(expected))) => actual == expected,
        _ => false,
    };
    if !resolves {
        warnings.push(VerificationWarning::BrokenLink(link_path.to_path_buf()));
    }
}

fn check_manifest(path: &Path, expected: &str, warnings: &mut Vec<VerificationWarning>) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        // already reported as a missing file
        Err(_) if !path.exists() => return,
        Err(err) => {
            warnings.push(VerificationWarning::ManifestUnreadable {
                path: path.to_path_buf(),
                detail: err.to_string(),
            });
            return;
        }
    };
    let manifest: CdmManifest = match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(err) => {
            warnings.push(VerificationWarning::ManifestUnreadable {
                path: path.to_path_buf(),
                detail: err.to_string(),
            });
            return;
        }
    };
    if manifest.version.as_deref() != Some(expected) {
        warnings.push(VerificationWarning::ManifestVersionMismatch {
            expected: expected.to_string(),
            found: manifest.version,
        });
    }
}
