use thiserror::Error;

/// Fatal outcomes of a provisioning run.
///
/// Stage code works with `anyhow` and is mapped onto one of these variants at
/// the pipeline boundary; `detail` carries the rendered context chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("configuration error: {detail}")]
    ConfigInvalid { detail: String },

    #[error("unsupported platform: this installer requires {required}, but this machine is {found}")]
    PlatformUnsupported { required: String, found: String },

    #[error("{app_id} is not installed as a Flatpak; install it first: {detail}")]
    RuntimeMissing { app_id: String, detail: String },

    #[error("glibc {found} is too old; {required} or newer is required")]
    VersionTooOld { found: String, required: String },

    #[error("required tool '{tool}' was not found on PATH")]
    ToolMissing { tool: String },

    #[error("failed to download {url}: {detail}")]
    FetchFailed { url: String, detail: String },

    #[error("failed to extract the CDM payload: {detail}")]
    ExtractFailed { detail: String },

    #[error("failed to patch the CDM library: {detail}")]
    PatchFailed { detail: String },

    #[error("failed to install the CDM files: {detail}")]
    PlacementFailed { detail: String },

    #[error("failed to configure the Flatpak sandbox: {detail}")]
    SandboxFailed { detail: String },

    #[error("installation cancelled")]
    Cancelled,
}

impl ProvisionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid { .. } => 2,
            Self::PlatformUnsupported { .. } => 10,
            Self::RuntimeMissing { .. } => 11,
            Self::VersionTooOld { .. } => 12,
            Self::ToolMissing { .. } => 13,
            Self::FetchFailed { .. } => 20,
            Self::ExtractFailed { .. } => 21,
            Self::PatchFailed { .. } => 22,
            Self::PlacementFailed { .. } => 23,
            Self::SandboxFailed { .. } => 24,
            Self::Cancelled => 130,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "config-invalid",
            Self::PlatformUnsupported { .. } => "platform-unsupported",
            Self::RuntimeMissing { .. } => "runtime-missing",
            Self::VersionTooOld { .. } => "version-too-old",
            Self::ToolMissing { .. } => "tool-missing",
            Self::FetchFailed { .. } => "fetch-failed",
            Self::ExtractFailed { .. } => "extract-failed",
            Self::PatchFailed { .. } => "patch-failed",
            Self::PlacementFailed { .. } => "placement-failed",
            Self::SandboxFailed { .. } => "sandbox-failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn fetch(url: &str, err: &anyhow::Error) -> Self {
        Self::FetchFailed {
            url: url.to_string(),
            detail: format!("{err:#}"),
        }
    }

    pub fn extract(err: &anyhow::Error) -> Self {
        Self::ExtractFailed {
            detail: format!("{err:#}"),
        }
    }

    pub fn patch(err: &anyhow::Error) -> Self {
        Self::PatchFailed {
            detail: format!("{err:#}"),
        }
    }

    pub fn placement(err: &anyhow::Error) -> Self {
        Self::PlacementFailed {
            detail: format!("{err:#}"),
        }
    }

    pub fn sandbox(err: &anyhow::Error) -> Self {
        Self::SandboxFailed {
            detail: format!("{err:#}"),
        }
    }
}
