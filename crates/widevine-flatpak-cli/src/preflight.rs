use std::process::Command;

use anyhow::Result;
use tracing::debug;
use widevine_flatpak_core::{LinkerVersion, ProvisionConfig, ProvisionError};
use widevine_flatpak_installer::capture_command;

/// Read-only view of the host the pipeline checks before touching anything.
pub(crate) trait HostProbe {
    fn arch(&self) -> String;
    fn runtime_installed(&self, app_id: &str) -> Result<()>;
    fn linker_version_output(&self) -> Result<String>;
    fn tool_on_path(&self, tool: &str) -> bool;
}

pub(crate) struct SystemProbe;

impl HostProbe for SystemProbe {
    fn arch(&self) -> String {
        std::env::consts::ARCH.to_string()
    }

    fn runtime_installed(&self, app_id: &str) -> Result<()> {
        let mut command = Command::new("flatpak");
        command.arg("info").arg(app_id);
        capture_command(&mut command, "flatpak info failed").map(|_| ())
    }

    fn linker_version_output(&self) -> Result<String> {
        let mut command = Command::new("ldd");
        command.arg("--version");
        capture_command(&mut command, "ldd --version failed")
    }

    fn tool_on_path(&self, tool: &str) -> bool {
        match which::which(tool) {
            Ok(path) => {
                debug!(tool, path = %path.display(), "tool resolved");
                true
            }
            Err(_) => false,
        }
    }
}

/// Checks architecture, runtime, glibc and tools in that order and stops at
/// the first failure. Nothing here writes to disk.
pub(crate) fn run_preflight(
    config: &ProvisionConfig,
    probe: &dyn HostProbe,
) -> Result<LinkerVersion, ProvisionError> {
    let arch = probe.arch();
    if arch != config.target_arch {
        return Err(ProvisionError::PlatformUnsupported {
            required: config.target_arch.clone(),
            found: arch,
        });
    }

    probe
        .runtime_installed(&config.app_id)
        .map_err(|err| ProvisionError::RuntimeMissing {
            app_id: config.app_id.clone(),
            detail: format!("{err:#}"),
        })?;

    let linker_version = probe
        .linker_version_output()
        .and_then(|output| LinkerVersion::from_ldd_output(&output))
        .map_err(|err| ProvisionError::VersionTooOld {
            found: format!("of unknown version ({err:#})"),
            required: config.min_linker_version.to_string(),
        })?;
    if !linker_version.satisfies_minimum(&config.min_linker_version) {
        return Err(ProvisionError::VersionTooOld {
            found: linker_version.to_string(),
            required: config.min_linker_version.to_string(),
        });
    }

    if let Some(tool) = config
        .required_tools
        .iter()
        .find(|tool| !probe.tool_on_path(tool))
    {
        return Err(ProvisionError::ToolMissing { tool: tool.clone() });
    }

    debug!(arch = %config.target_arch, glibc = %linker_version, "preflight passed");
    Ok(linker_version)
}
