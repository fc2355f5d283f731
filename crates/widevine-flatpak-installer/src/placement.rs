use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::discovery::{plan_discovery_links, DiscoveryLink};
use crate::fs_utils::{remove_dir_all_if_exists, remove_file_if_exists, set_mode};
use crate::{ExtractedPayload, InstallLayout, PatchedLibrary};

const LIBRARY_MODE: u32 = 0o755;
const METADATA_MODE: u32 = 0o444;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBundle {
    pub dir: PathBuf,
    pub library: PathBuf,
    pub manifest: PathBuf,
    pub license: PathBuf,
    pub discovery_dir: PathBuf,
    pub links: Vec<DiscoveryLink>,
}

/// Replaces the versioned bundle directory with the patched library, the
/// manifest and the license, then links the discovery directory back at them.
pub fn place_bundle(
    layout: &InstallLayout,
    payload: &ExtractedPayload,
    patched: &PatchedLibrary,
) -> Result<InstalledBundle> {
    let dir = layout.bundle_dir();
    // read-only files from an earlier run cannot be overwritten in place
    remove_dir_all_if_exists(&dir)
        .with_context(|| format!("failed to remove existing bundle dir: {}", dir.display()))?;
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let library = layout.library_path();
    let manifest = layout.manifest_path();
    let license = layout.license_path();
    install_file(&patched.path, &library, LIBRARY_MODE)?;
    install_file(&payload.manifest, &manifest, METADATA_MODE)?;
    install_file(&payload.license, &license, METADATA_MODE)?;

    let links = plan_discovery_links(layout);
    materialize_links(&dir, &links)?;

    info!(path = %dir.display(), "bundle placed");
    Ok(InstalledBundle {
        dir,
        library,
        manifest,
        license,
        discovery_dir: layout.discovery_dir(),
        links,
    })
}

fn install_file(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    set_mode(dst, mode)
        .with_context(|| format!("failed to set mode {mode:o} on {}", dst.display()))?;
    debug!(
        src = %src.display(),
        dst = %dst.display(),
        mode = %format!("{mode:o}"),
        "installed file"
    );
    Ok(())
}

pub(crate) fn materialize_links(bundle_dir: &Path, links: &[DiscoveryLink]) -> Result<()> {
    for link in links {
        if link.resolved().is_none() {
            return Err(anyhow!(
                "discovery link {} escapes the bundle directory",
                link.link.display()
            ));
        }

        let link_path = bundle_dir.join(&link.link);
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        remove_file_if_exists(&link_path)
            .with_context(|| format!("failed to replace {}", link_path.display()))?;
        create_symlink(&link.target, &link_path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link_path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link_path).with_context(|| {
        format!(
            "failed to create symlink {} -> {}",
            link_path.display(),
            target.display()
        )
    })
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, link_path: &Path) -> Result<()> {
    Err(anyhow!(
        "symlinked discovery directories are supported only on Unix hosts: {}",
        link_path.display()
    ))
}
