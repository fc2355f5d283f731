use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::InstallLayout;

/// One symlink of the plugin discovery directory.
///
/// `link` is relative to the bundle directory; `target` is the literal link
/// contents, relative to the link's parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLink {
    pub link: PathBuf,
    pub target: PathBuf,
}

impl DiscoveryLink {
    fn to_sibling(discovery_rel: &Path, file_name: &str) -> Self {
        let mut target = PathBuf::new();
        for _ in discovery_rel.components() {
            target.push("..");
        }
        target.push(file_name);
        Self {
            link: discovery_rel.join(file_name),
            target,
        }
    }

    /// Bundle-relative path the link points at, or `None` if it escapes the
    /// bundle directory.
    pub fn resolved(&self) -> Option<PathBuf> {
        let mut parts: Vec<OsString> = Vec::new();
        let parent = self.link.parent().map(PathBuf::from).unwrap_or_default();
        for component in parent.join(&self.target).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_os_string()),
                Component::ParentDir => {
                    parts.pop()?;
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(parts.into_iter().collect())
    }
}

/// Links Firefox expects under `gmp-widevinecdm/<version-dir>/`, each pointing
/// back at a file placed directly in the bundle directory.
pub fn plan_discovery_links(layout: &InstallLayout) -> Vec<DiscoveryLink> {
    let discovery_rel =
        PathBuf::from(layout.plugin_dir_name()).join(layout.plugin_version_dir_name());
    vec![
        DiscoveryLink::to_sibling(&discovery_rel, layout.library_file_name()),
        DiscoveryLink::to_sibling(&discovery_rel, layout.manifest_file_name()),
    ]
}
