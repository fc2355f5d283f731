use std::path::PathBuf;

use crate::LinkerVersion;

/// Pinned location of the ChromeOS image the CDM is taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub base_url: String,
    pub name: String,
    pub version: String,
}

impl ArchiveSource {
    pub fn url(&self) -> String {
        format!(
            "{}/{}-{}",
            self.base_url.trim_end_matches('/'),
            self.name,
            self.version
        )
    }
}

/// Relative paths of the payload files below the extraction root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadPaths {
    pub pattern: String,
    pub library: PathBuf,
    pub manifest: PathBuf,
    pub license: PathBuf,
}

/// Every constant one provisioning run depends on.
///
/// The pipeline never reads process-wide state other than `HOME`; tests build
/// their own value instead of using [`ProvisionConfig::pinned`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    pub target_arch: String,
    pub app_id: String,
    pub min_linker_version: LinkerVersion,
    pub required_tools: Vec<String>,
    pub archive: ArchiveSource,
    pub archive_file_name: String,
    pub payload: PayloadPaths,
    pub cdm_version: String,
    pub library_file_name: String,
    pub manifest_file_name: String,
    pub license_file_name: String,
    pub plugin_dir_name: String,
    pub plugin_version_dir_name: String,
    pub gmp_path_env: String,
    pub patcher_program: String,
    pub workspace_prefix: String,
    pub pref_file_name: String,
}

impl ProvisionConfig {
    pub fn pinned() -> Self {
        Self {
            target_arch: "aarch64".to_string(),
            app_id: "org.mozilla.firefox".to_string(),
            min_linker_version: LinkerVersion::new(2, 36, 0),
            required_tools: vec![
                "flatpak".to_string(),
                "unsquashfs".to_string(),
                "widevine-fixup".to_string(),
            ],
            archive: ArchiveSource {
                base_url: "https://commondatastorage.googleapis.com/chromeos-localmirror/distfiles"
                    .to_string(),
                name: "chromeos-lacros-arm64-squash-zstd".to_string(),
                version: "120.0.6098.0".to_string(),
            },
            archive_file_name: "lacros.squashfs".to_string(),
            payload: PayloadPaths {
                pattern: "WidevineCdm/*".to_string(),
                library: PathBuf::from(
                    "WidevineCdm/_platform_specific/cros_arm64/libwidevinecdm.so",
                ),
                manifest: PathBuf::from("WidevineCdm/manifest.json"),
                license: PathBuf::from("WidevineCdm/LICENSE"),
            },
            cdm_version: "4.10.2710.0".to_string(),
            library_file_name: "libwidevinecdm.so".to_string(),
            manifest_file_name: "manifest.json".to_string(),
            license_file_name: "LICENSE".to_string(),
            plugin_dir_name: "gmp-widevinecdm".to_string(),
            plugin_version_dir_name: "system-installed".to_string(),
            gmp_path_env: "MOZ_GMP_PATH".to_string(),
            patcher_program: "widevine-fixup".to_string(),
            workspace_prefix: "widevine-flatpak.".to_string(),
            pref_file_name: "gmpwidevine.js".to_string(),
        }
    }

    pub fn archive_url(&self) -> String {
        self.archive.url()
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self::pinned()
    }
}
