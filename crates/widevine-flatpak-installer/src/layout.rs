use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use widevine_flatpak_core::ProvisionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    app_root: PathBuf,
    cdm_version: String,
    library_file_name: String,
    manifest_file_name: String,
    license_file_name: String,
    plugin_dir_name: String,
    plugin_version_dir_name: String,
    pref_file_name: String,
}

impl InstallLayout {
    pub fn new(home: &Path, config: &ProvisionConfig) -> Self {
        Self {
            app_root: home.join(".var").join("app").join(&config.app_id),
            cdm_version: config.cdm_version.clone(),
            library_file_name: config.library_file_name.clone(),
            manifest_file_name: config.manifest_file_name.clone(),
            license_file_name: config.license_file_name.clone(),
            plugin_dir_name: config.plugin_dir_name.clone(),
            plugin_version_dir_name: config.plugin_version_dir_name.clone(),
            pref_file_name: config.pref_file_name.clone(),
        }
    }

    /// Per-app data root owned by the Flatpak sandbox.
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn install_root(&self) -> PathBuf {
        self.app_root.join("widevine")
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.install_root().join(&self.cdm_version)
    }

    pub fn library_path(&self) -> PathBuf {
        self.bundle_dir().join(&self.library_file_name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.bundle_dir().join(&self.manifest_file_name)
    }

    pub fn license_path(&self) -> PathBuf {
        self.bundle_dir().join(&self.license_file_name)
    }

    pub fn plugin_dir(&self) -> PathBuf {
        self.bundle_dir().join(&self.plugin_dir_name)
    }

    /// Directory Firefox scans for the CDM; `MOZ_GMP_PATH` points here.
    pub fn discovery_dir(&self) -> PathBuf {
        self.plugin_dir().join(&self.plugin_version_dir_name)
    }

    pub fn readme_path(&self) -> PathBuf {
        self.install_root().join("README.txt")
    }

    pub fn prefs_dir(&self) -> PathBuf {
        self.app_root
            .join(".mozilla")
            .join("firefox")
            .join("defaults")
            .join("pref")
    }

    pub fn pref_path(&self) -> PathBuf {
        self.prefs_dir().join(&self.pref_file_name)
    }

    pub fn cdm_version(&self) -> &str {
        &self.cdm_version
    }

    pub fn library_file_name(&self) -> &str {
        &self.library_file_name
    }

    pub fn manifest_file_name(&self) -> &str {
        &self.manifest_file_name
    }

    pub fn license_file_name(&self) -> &str {
        &self.license_file_name
    }

    pub fn plugin_dir_name(&self) -> &str {
        &self.plugin_dir_name
    }

    pub fn plugin_version_dir_name(&self) -> &str {
        &self.plugin_version_dir_name
    }
}

pub fn default_home_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve Flatpak app data")?;
    if home.trim().is_empty() {
        return Err(anyhow!("HOME is empty; cannot resolve Flatpak app data"));
    }
    Ok(PathBuf::from(home))
}
