mod discovery;
mod extract;
mod fs_utils;
mod layout;
mod patch;
mod placement;
mod prefs;
mod readme;
mod sandbox;
mod verify;
mod workspace;

pub use discovery::{plan_discovery_links, DiscoveryLink};
pub use extract::{
    capture_command, locate_payload, ExtractedPayload, PayloadExtractor, SquashfsExtractor,
};
pub use layout::{default_home_dir, InstallLayout};
pub use patch::{patch_library, LibraryTransformer, PatchedLibrary, SubprocessTransformer};
pub use placement::{place_bundle, InstalledBundle};
pub use prefs::{render_preferences, write_preferences};
pub use readme::{render_readme, write_readme};
pub use sandbox::{
    parse_override_listing, FlatpakOverrideStore, OverrideRequest, SandboxOverrides, SandboxStore,
};
pub use verify::{verify_installation, VerificationWarning};
pub use workspace::{CleanupSlot, Workspace};
