use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};
use widevine_flatpak_core::{ProvisionConfig, ProvisionError};
use widevine_flatpak_installer::{
    locate_payload, patch_library, place_bundle, verify_installation, write_preferences,
    write_readme, CleanupSlot, InstallLayout, InstalledBundle, LibraryTransformer,
    OverrideRequest, PayloadExtractor, SandboxStore, VerificationWarning, Workspace,
};

use crate::fetch::ArchiveFetcher;
use crate::preflight::{run_preflight, HostProbe};
use crate::prompt::{Confirm, Decision};
use crate::render::TerminalRenderer;

/// External capabilities the pipeline drives; each one is faked in tests.
pub(crate) struct Collaborators<'a> {
    pub(crate) probe: &'a dyn HostProbe,
    pub(crate) prompt: &'a dyn Confirm,
    pub(crate) fetcher: &'a dyn ArchiveFetcher,
    pub(crate) extractor: &'a dyn PayloadExtractor,
    pub(crate) transformer: &'a dyn LibraryTransformer,
    pub(crate) sandbox: &'a dyn SandboxStore,
}

#[derive(Debug)]
pub(crate) struct ProvisionReport {
    pub(crate) bundle: InstalledBundle,
    pub(crate) pref_path: PathBuf,
    pub(crate) readme_path: PathBuf,
    pub(crate) warnings: Vec<VerificationWarning>,
}

pub(crate) struct Pipeline<'a> {
    config: ProvisionConfig,
    layout: InstallLayout,
    cleanup: CleanupSlot,
    workspace_parent: Option<PathBuf>,
    renderer: TerminalRenderer,
    deps: Collaborators<'a>,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        config: ProvisionConfig,
        home: &Path,
        cleanup: CleanupSlot,
        renderer: TerminalRenderer,
        deps: Collaborators<'a>,
    ) -> Self {
        let layout = InstallLayout::new(home, &config);
        Self {
            config,
            layout,
            cleanup,
            workspace_parent: None,
            renderer,
            deps,
        }
    }

    /// Creates the workspace below `parent` instead of the system temp dir.
    pub(crate) fn with_workspace_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.workspace_parent = Some(parent.into());
        self
    }

    pub(crate) fn run(&self) -> Result<ProvisionReport, ProvisionError> {
        let linker_version = run_preflight(&self.config, self.deps.probe)?;
        self.renderer.print_status(
            "checked",
            &format!(
                "{} host, {} installed, glibc {}",
                self.config.target_arch, self.config.app_id, linker_version
            ),
        );

        let workspace = Workspace::create(
            &self.cleanup,
            self.workspace_parent.as_deref(),
            &self.config.workspace_prefix,
        )
        .map_err(|err| ProvisionError::placement(&err))?;

        let result = self.run_in_workspace(&workspace);
        if let Err(err) = workspace.release() {
            warn!("{err:#}");
        }
        result
    }

    fn run_in_workspace(&self, workspace: &Workspace) -> Result<ProvisionReport, ProvisionError> {
        let config = &self.config;
        let deps = &self.deps;

        self.renderer.print_section("Widevine CDM installer");
        self.renderer.print_lines(&[
            format!(
                "This downloads a ChromeOS image from Google, extracts Widevine CDM {} and",
                config.cdm_version
            ),
            format!(
                "installs it for the {} Flatpak under {}.",
                config.app_id,
                self.layout.install_root().display()
            ),
        ]);
        self.gate("Press any key to continue, or Ctrl-C to cancel.")?;

        let url = config.archive_url();
        let archive = workspace.archive_path(&config.archive_file_name);
        self.renderer.print_status("fetch", &url);
        let bytes = deps
            .fetcher
            .fetch(&url, &archive)
            .map_err(|err| ProvisionError::fetch(&url, &err))?;
        info!(bytes, "archive fetched");

        let payload_dir = workspace.payload_dir();
        self.renderer.print_status("extract", &config.payload.pattern);
        let payload = deps
            .extractor
            .extract(&archive, &config.payload.pattern, &payload_dir)
            .and_then(|()| locate_payload(&payload_dir, &config.payload))
            .map_err(|err| ProvisionError::extract(&err))?;

        let license = fs::read_to_string(&payload.license)
            .with_context(|| format!("failed to read {}", payload.license.display()))
            .map_err(|err| ProvisionError::extract(&err))?;
        self.renderer.print_section("Widevine license");
        self.renderer.print_block(&license);
        self.gate("Press any key to accept the license and continue, or Ctrl-C to cancel.")?;

        self.renderer.print_status("patch", &payload.library.display().to_string());
        let patched = patch_library(
            deps.transformer,
            &payload.library,
            &workspace.patched_library_path(&config.library_file_name),
        )
        .map_err(|err| ProvisionError::patch(&err))?;
        info!(bytes = patched.len, "library patched");

        self.renderer
            .print_status("install", &self.layout.bundle_dir().display().to_string());
        let bundle = place_bundle(&self.layout, &payload, &patched)
            .map_err(|err| ProvisionError::placement(&err))?;

        let request = OverrideRequest {
            env_key: config.gmp_path_env.clone(),
            env_value: bundle.discovery_dir.display().to_string(),
            read_only_path: bundle.dir.clone(),
        };
        self.renderer.print_status(
            "override",
            &format!("{}={}", request.env_key, request.env_value),
        );
        deps.sandbox
            .apply(&config.app_id, &request)
            .map_err(|err| ProvisionError::sandbox(&err))?;

        let pref_path =
            write_preferences(&self.layout).map_err(|err| ProvisionError::placement(&err))?;
        self.renderer.print_status("prefs", &pref_path.display().to_string());
        let readme_path = write_readme(&self.layout, &config.app_id, &url)
            .map_err(|err| ProvisionError::placement(&err))?;

        let warnings = verify_installation(
            &self.layout,
            deps.sandbox,
            &config.app_id,
            &config.gmp_path_env,
        );
        for warning in &warnings {
            self.renderer.print_warning(&warning.to_string());
        }

        Ok(ProvisionReport {
            bundle,
            pref_path,
            readme_path,
            warnings,
        })
    }

    fn gate(&self, prompt: &str) -> Result<(), ProvisionError> {
        match self.deps.prompt.confirm(prompt) {
            Ok(Decision::Proceed) => Ok(()),
            Ok(Decision::Cancel) => Err(ProvisionError::Cancelled),
            Err(err) => {
                warn!("{err:#}");
                Err(ProvisionError::Cancelled)
            }
        }
    }
}
