use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::InstallLayout;

pub fn render_preferences(cdm_version: &str) -> String {
    let mut payload = String::new();
    payload.push_str("// Generated by widevine-flatpak. Overwritten on every run.\n");
    payload.push_str(&format!(
        "pref(\"media.gmp-widevinecdm.version\", \"{cdm_version}\");\n"
    ));
    payload.push_str("pref(\"media.gmp-widevinecdm.visible\", true);\n");
    payload.push_str("pref(\"media.gmp-widevinecdm.enabled\", true);\n");
    payload.push_str("pref(\"media.gmp-widevinecdm.autoupdate\", false);\n");
    payload.push_str("pref(\"media.eme.enabled\", true);\n");
    payload.push_str("pref(\"media.eme.encrypted-media-encryption-scheme.enabled\", true);\n");
    payload
}

/// Writes the Firefox default-pref file, replacing whatever was there.
pub fn write_preferences(layout: &InstallLayout) -> Result<PathBuf> {
    let dir = layout.prefs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create prefs dir: {}", dir.display()))?;

    let path = layout.pref_path();
    let payload = render_preferences(layout.cdm_version());
    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write preferences: {}", path.display()))?;
    Ok(path)
}
