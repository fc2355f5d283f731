use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::extract::{capture_command, run_command};

/// Persisted per-app overrides as reported by `flatpak override --show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOverrides {
    pub environment: BTreeMap<String, String>,
    pub filesystems: BTreeSet<String>,
}

impl SandboxOverrides {
    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }

    pub fn grants_read_only(&self, path: &Path) -> bool {
        self.filesystems.contains(&read_only_entry(path))
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRequest {
    pub env_key: String,
    pub env_value: String,
    pub read_only_path: PathBuf,
}

impl OverrideRequest {
    fn env_arg(&self) -> String {
        format!("--env={}={}", self.env_key, self.env_value)
    }

    fn filesystem_arg(&self) -> String {
        format!("--filesystem={}", read_only_entry(&self.read_only_path))
    }
}

/// Permission store of the sandbox runtime.
pub trait SandboxStore {
    fn show(&self, app_id: &str) -> Result<SandboxOverrides>;
    fn apply(&self, app_id: &str, request: &OverrideRequest) -> Result<()>;
}

/// Per-user Flatpak overrides, driven through the `flatpak` CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatpakOverrideStore;

impl FlatpakOverrideStore {
    pub(crate) fn build_show_command(app_id: &str) -> Command {
        let mut command = Command::new("flatpak");
        command.arg("override").arg("--user").arg("--show").arg(app_id);
        command
    }

    pub(crate) fn build_apply_command(app_id: &str, request: &OverrideRequest) -> Command {
        let mut command = Command::new("flatpak");
        command
            .arg("override")
            .arg("--user")
            .arg(request.env_arg())
            .arg(request.filesystem_arg())
            .arg(app_id);
        command
    }
}

impl SandboxStore for FlatpakOverrideStore {
    fn show(&self, app_id: &str) -> Result<SandboxOverrides> {
        let mut command = Self::build_show_command(app_id);
        let raw = capture_command(&mut command, "failed to query Flatpak overrides")?;
        parse_override_listing(&raw)
            .with_context(|| format!("failed to parse Flatpak overrides for {app_id}"))
    }

    fn apply(&self, app_id: &str, request: &OverrideRequest) -> Result<()> {
        let mut command = Self::build_apply_command(app_id, request);
        debug!(command = ?command, "applying Flatpak override");
        run_command(&mut command, "failed to apply Flatpak override")
    }
}

/// Parses the key file printed by `flatpak override --show`.
pub fn parse_override_listing(raw: &str) -> Result<SandboxOverrides> {
    let mut overrides = SandboxOverrides::default();
    let mut group: Option<String> = None;

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[') {
            let name = name
                .strip_suffix(']')
                .ok_or_else(|| anyhow!("line {}: unterminated group header", index + 1))?;
            group = Some(name.to_string());
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("line {}: expected key=value, got '{line}'", index + 1))?;
        match group.as_deref() {
            Some("Context") if key.trim() == "filesystems" => {
                for entry in value.split(';').map(str::trim) {
                    if !entry.is_empty() {
                        overrides.filesystems.insert(entry.to_string());
                    }
                }
            }
            Some("Environment") => {
                overrides
                    .environment
                    .insert(key.trim().to_string(), value.to_string());
            }
            Some(_) => {}
            None => {
                return Err(anyhow!(
                    "line {}: key '{}' appears before any group header",
                    index + 1,
                    key.trim()
                ));
            }
        }
    }

    Ok(overrides)
}

fn read_only_entry(path: &Path) -> String {
    format!("{}:ro", path.display())
}
