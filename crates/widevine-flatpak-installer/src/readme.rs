use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::InstallLayout;

/// Summary of the installed state plus manual uninstall steps.
///
/// Carries no timestamps so a rerun with the same pins rewrites identical bytes.
pub fn render_readme(layout: &InstallLayout, app_id: &str, archive_url: &str) -> String {
    let lines = [
        "Widevine CDM for Flatpak Firefox".to_string(),
        "================================".to_string(),
        String::new(),
        format!("CDM version:      {}", layout.cdm_version()),
        format!("Source image:     {archive_url}"),
        format!("Installed to:     {}", layout.bundle_dir().display()),
        format!("Plugin directory: {}", layout.discovery_dir().display()),
        format!("Preferences:      {}", layout.pref_path().display()),
        String::new(),
        format!(
            "The Flatpak override for {app_id} sets MOZ_GMP_PATH to the plugin directory"
        ),
        "and grants read-only access to the installed files.".to_string(),
        String::new(),
        "To uninstall:".to_string(),
        String::new(),
        format!("  rm -rf '{}'", layout.install_root().display()),
        format!("  flatpak override --user --reset {app_id}"),
        format!("  rm -f '{}'", layout.pref_path().display()),
        String::new(),
        "Note: the reset also drops any other per-user overrides of this app.".to_string(),
        String::new(),
    ];
    lines.join("\n")
}

pub fn write_readme(layout: &InstallLayout, app_id: &str, archive_url: &str) -> Result<PathBuf> {
    let path = layout.readme_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, render_readme(layout, app_id, archive_url).as_bytes())
        .with_context(|| format!("failed to write README: {}", path.display()))?;
    Ok(path)
}
