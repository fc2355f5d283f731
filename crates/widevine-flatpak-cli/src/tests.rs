use super::*;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use widevine_flatpak_core::LinkerVersion;
use widevine_flatpak_installer::{
    InstallLayout, LibraryTransformer, OverrideRequest, PayloadExtractor, SandboxOverrides,
    SandboxStore,
};

use crate::fetch::{copy_with_progress, discard_partial_download, ArchiveFetcher};
use crate::preflight::{run_preflight, HostProbe};
use crate::prompt::{decision_for_key, decision_for_line, Confirm, Decision};
use crate::render::{render_status_line, render_transfer_line, OutputStyle};

const MANIFEST_JSON: &str = r#"{"name":"WidevineCdm","version":"4.10.2710.0"}"#;
const UNPATCHED: &[u8] = b"\x7fELF 4k-aligned library";
const PATCH_MARKER: &[u8] = b" +16k";

static TEST_ROOT_SEQ: AtomicU64 = AtomicU64::new(0);

fn test_root(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = TEST_ROOT_SEQ.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!(
        "widevine-flatpak-cli-{tag}-{}-{nanos}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(root.join("tmp")).expect("must create test root");
    root
}

struct FakeProbe {
    arch: &'static str,
    runtime_installed: bool,
    ldd_output: Option<&'static str>,
    missing_tools: Vec<&'static str>,
}

impl FakeProbe {
    fn healthy() -> Self {
        Self {
            arch: "aarch64",
            runtime_installed: true,
            ldd_output: Some("ldd (GNU libc) 2.39\n"),
            missing_tools: Vec::new(),
        }
    }
}

impl HostProbe for FakeProbe {
    fn arch(&self) -> String {
        self.arch.to_string()
    }

    fn runtime_installed(&self, app_id: &str) -> Result<()> {
        if self.runtime_installed {
            Ok(())
        } else {
            Err(anyhow!("error: {app_id} not installed"))
        }
    }

    fn linker_version_output(&self) -> Result<String> {
        self.ldd_output
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ldd --version failed: command failed to start"))
    }

    fn tool_on_path(&self, tool: &str) -> bool {
        !self.missing_tools.contains(&tool)
    }
}

struct ScriptedPrompt {
    answers: RefCell<VecDeque<Decision>>,
    asked: Cell<usize>,
}

impl ScriptedPrompt {
    fn new(answers: &[Decision]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            asked: Cell::new(0),
        }
    }

    fn always_proceed() -> Self {
        Self::new(&[Decision::Proceed, Decision::Proceed])
    }
}

impl Confirm for ScriptedPrompt {
    fn confirm(&self, _prompt: &str) -> Result<Decision> {
        self.asked.set(self.asked.get() + 1);
        self.answers
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("prompt asked more often than scripted"))
    }
}

#[derive(Default)]
struct FakeFetcher {
    calls: Cell<usize>,
    fail: bool,
    workspace_seen: RefCell<Option<PathBuf>>,
}

impl ArchiveFetcher for FakeFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        self.calls.set(self.calls.get() + 1);
        *self.workspace_seen.borrow_mut() = dest.parent().map(Path::to_path_buf);
        if self.fail {
            return Err(anyhow!("server responded with HTTP 404 Not Found for {url}"));
        }
        fs::write(dest, b"squashfs image")?;
        Ok(14)
    }
}

struct FakeExtractor {
    produce_payload: bool,
}

impl PayloadExtractor for FakeExtractor {
    fn extract(&self, image: &Path, pattern: &str, dest: &Path) -> Result<()> {
        if !image.is_file() {
            return Err(anyhow!("image missing: {}", image.display()));
        }
        if !self.produce_payload {
            return Err(anyhow!(
                "extraction produced no files matching '{pattern}' from {}",
                image.display()
            ));
        }
        let paths = ProvisionConfig::pinned().payload;
        for (rel, contents) in [
            (&paths.library, UNPATCHED),
            (&paths.manifest, MANIFEST_JSON.as_bytes()),
            (&paths.license, b"Widevine license terms\n".as_slice()),
        ] {
            let path = dest.join(rel);
            fs::create_dir_all(path.parent().expect("payload parent"))?;
            fs::write(path, contents)?;
        }
        Ok(())
    }
}

struct FakeTransformer {
    fail: bool,
}

impl LibraryTransformer for FakeTransformer {
    fn transform(&self, input: &Path, output: &Path) -> Result<()> {
        if self.fail {
            return Err(anyhow!("'widevine-fixup' failed: status=exit status: 1"));
        }
        let mut bytes = fs::read(input)?;
        bytes.extend_from_slice(PATCH_MARKER);
        fs::write(output, bytes)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemorySandbox {
    state: RefCell<SandboxOverrides>,
    applied: Cell<usize>,
    fail_apply: bool,
}

impl SandboxStore for MemorySandbox {
    fn show(&self, _app_id: &str) -> Result<SandboxOverrides> {
        Ok(self.state.borrow().clone())
    }

    fn apply(&self, _app_id: &str, request: &OverrideRequest) -> Result<()> {
        if self.fail_apply {
            return Err(anyhow!("failed to apply Flatpak override: status=exit status: 1"));
        }
        self.applied.set(self.applied.get() + 1);
        merge_override(&mut self.state.borrow_mut(), request);
        Ok(())
    }
}

/// Mirrors how Flatpak merges an override: the variable is replaced and any
/// earlier grant of the same path gives way to the read-only one.
fn merge_override(state: &mut SandboxOverrides, request: &OverrideRequest) {
    state
        .environment
        .insert(request.env_key.clone(), request.env_value.clone());
    let path = request.read_only_path.display().to_string();
    state.filesystems.retain(|entry| granted_path(entry) != path);
    state.filesystems.insert(format!("{path}:ro"));
}

fn granted_path(entry: &str) -> &str {
    let entry = entry.strip_prefix('!').unwrap_or(entry);
    match entry.rsplit_once(':') {
        Some((path, "ro" | "rw" | "create")) => path,
        _ => entry,
    }
}

struct Fakes {
    probe: FakeProbe,
    prompt: ScriptedPrompt,
    fetcher: FakeFetcher,
    extractor: FakeExtractor,
    transformer: FakeTransformer,
    sandbox: MemorySandbox,
}

impl Fakes {
    fn healthy() -> Self {
        Self {
            probe: FakeProbe::healthy(),
            prompt: ScriptedPrompt::always_proceed(),
            fetcher: FakeFetcher::default(),
            extractor: FakeExtractor {
                produce_payload: true,
            },
            transformer: FakeTransformer { fail: false },
            sandbox: MemorySandbox::default(),
        }
    }
}

fn run_pipeline(root: &Path, fakes: &Fakes) -> Result<ProvisionReport, ProvisionError> {
    Pipeline::new(
        ProvisionConfig::pinned(),
        &root.join("home"),
        CleanupSlot::new(),
        TerminalRenderer::from_style(OutputStyle::Plain),
        Collaborators {
            probe: &fakes.probe,
            prompt: &fakes.prompt,
            fetcher: &fakes.fetcher,
            extractor: &fakes.extractor,
            transformer: &fakes.transformer,
            sandbox: &fakes.sandbox,
        },
    )
    .with_workspace_parent(root.join("tmp"))
    .run()
}

fn layout_for(root: &Path) -> InstallLayout {
    InstallLayout::new(&root.join("home"), &ProvisionConfig::pinned())
}

fn workspace_entries(root: &Path) -> Vec<PathBuf> {
    fs::read_dir(root.join("tmp"))
        .expect("must read workspace parent")
        .map(|entry| entry.expect("entry").path())
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum TreeEntry {
    Dir,
    File(Vec<u8>),
    Link(PathBuf),
}

fn snapshot_tree(root: &Path) -> BTreeMap<PathBuf, TreeEntry> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, TreeEntry>) {
        for entry in fs::read_dir(dir).expect("must read dir") {
            let path = entry.expect("entry").path();
            let rel = path.strip_prefix(base).expect("relative").to_path_buf();
            let metadata = fs::symlink_metadata(&path).expect("must stat");
            if metadata.file_type().is_symlink() {
                out.insert(rel, TreeEntry::Link(fs::read_link(&path).expect("link")));
            } else if metadata.is_dir() {
                out.insert(rel, TreeEntry::Dir);
                walk(base, &path, out);
            } else {
                out.insert(rel, TreeEntry::File(fs::read(&path).expect("file")));
            }
        }
    }

    let mut out = BTreeMap::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out
}

#[cfg(unix)]
#[test]
fn pipeline_installs_patched_library_and_configures_sandbox() {
    let root = test_root("success");
    let fakes = Fakes::healthy();

    let report = run_pipeline(&root, &fakes).expect("pipeline must succeed");
    let layout = layout_for(&root);

    let mut expected_library = UNPATCHED.to_vec();
    expected_library.extend_from_slice(PATCH_MARKER);
    assert_eq!(
        fs::read(&report.bundle.library).expect("installed library"),
        expected_library
    );
    for link in &report.bundle.links {
        let link_path = report.bundle.dir.join(&link.link);
        assert!(fs::symlink_metadata(&link_path)
            .expect("link")
            .file_type()
            .is_symlink());
    }

    let overrides = fakes.sandbox.state.borrow().clone();
    assert_eq!(
        overrides.env("MOZ_GMP_PATH"),
        Some(layout.discovery_dir().display().to_string().as_str())
    );
    assert!(overrides.grants_read_only(&layout.bundle_dir()));
    assert_eq!(report.pref_path, layout.pref_path());
    assert_eq!(report.readme_path, layout.readme_path());
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);

    assert_eq!(fakes.prompt.asked.get(), 2);
    assert_eq!(fakes.fetcher.calls.get(), 1);
    let seen = fakes
        .fetcher
        .workspace_seen
        .borrow()
        .clone()
        .expect("fetch saw a workspace");
    assert!(seen.starts_with(root.join("tmp")));
    assert!(seen
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("widevine-flatpak.")));
    assert!(!seen.exists(), "workspace must be removed after success");
    assert!(workspace_entries(&root).is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn pipeline_rerun_reaches_identical_end_state() {
    let root = test_root("rerun");
    let fakes = Fakes {
        prompt: ScriptedPrompt::new(&[Decision::Proceed; 4]),
        ..Fakes::healthy()
    };
    let layout = layout_for(&root);

    run_pipeline(&root, &fakes).expect("first run");
    let first_tree = snapshot_tree(layout.app_root());
    let first_overrides = fakes.sandbox.state.borrow().clone();

    run_pipeline(&root, &fakes).expect("second run");
    let second_tree = snapshot_tree(layout.app_root());
    let second_overrides = fakes.sandbox.state.borrow().clone();

    assert!(!first_tree.is_empty());
    assert_eq!(first_tree, second_tree);
    assert_eq!(first_overrides, second_overrides);
    assert_eq!(fakes.sandbox.applied.get(), 2);
    assert!(workspace_entries(&root).is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unsupported_architecture_stops_before_network_access() {
    let root = test_root("arch");
    let fakes = Fakes {
        probe: FakeProbe {
            arch: "x86_64",
            ..FakeProbe::healthy()
        },
        ..Fakes::healthy()
    };

    let err = run_pipeline(&root, &fakes).expect_err("must reject x86_64");
    assert_eq!(
        err,
        ProvisionError::PlatformUnsupported {
            required: "aarch64".to_string(),
            found: "x86_64".to_string(),
        }
    );
    assert_eq!(err.exit_code(), 10);
    assert_eq!(fakes.fetcher.calls.get(), 0);
    assert_eq!(fakes.prompt.asked.get(), 0);
    assert!(workspace_entries(&root).is_empty());
    assert!(!layout_for(&root).app_root().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn preflight_compares_glibc_versions_numerically() {
    let config = ProvisionConfig::pinned();
    for (output, accepted) in [
        ("ldd (GNU libc) 2.35\n", false),
        ("ldd (GNU libc) 2.36\n", true),
        ("ldd (GNU libc) 2.40\n", true),
        ("ldd (GNU libc) 2.4\n", false),
    ] {
        let probe = FakeProbe {
            ldd_output: Some(output),
            ..FakeProbe::healthy()
        };
        let result = run_preflight(&config, &probe);
        match (accepted, result) {
            (true, Ok(version)) => assert!(version >= LinkerVersion::new(2, 36, 0)),
            (false, Err(ProvisionError::VersionTooOld { found, required })) => {
                assert_eq!(required, "2.36");
                assert!(output.contains(&found), "{found} must come from {output}");
            }
            (accepted, other) => panic!("{output}: accepted={accepted}, got {other:?}"),
        }
    }
}

#[test]
fn preflight_reports_unreadable_linker_version_as_too_old() {
    let probe = FakeProbe {
        ldd_output: None,
        ..FakeProbe::healthy()
    };
    let err = run_preflight(&ProvisionConfig::pinned(), &probe).expect_err("must fail");
    assert_eq!(err.kind(), "version-too-old");
    assert!(err.to_string().contains("ldd --version failed"));
}

#[test]
fn preflight_checks_runtime_before_linker_and_tools() {
    let probe = FakeProbe {
        runtime_installed: false,
        ldd_output: None,
        missing_tools: vec!["unsquashfs"],
        ..FakeProbe::healthy()
    };
    let err = run_preflight(&ProvisionConfig::pinned(), &probe).expect_err("must fail");
    assert_eq!(err.kind(), "runtime-missing");
    assert_eq!(err.exit_code(), 11);
}

#[test]
fn preflight_names_first_missing_tool() {
    let probe = FakeProbe {
        missing_tools: vec!["widevine-fixup", "unsquashfs"],
        ..FakeProbe::healthy()
    };
    let err = run_preflight(&ProvisionConfig::pinned(), &probe).expect_err("must fail");
    assert_eq!(
        err,
        ProvisionError::ToolMissing {
            tool: "unsquashfs".to_string()
        }
    );
}

#[test]
fn patch_failure_places_nothing_and_leaves_override_untouched() {
    let root = test_root("patch-fail");
    let fakes = Fakes {
        transformer: FakeTransformer { fail: true },
        ..Fakes::healthy()
    };
    let mut before = SandboxOverrides::default();
    before
        .environment
        .insert("MOZ_ENABLE_WAYLAND".to_string(), "1".to_string());
    before.filesystems.insert("xdg-download".to_string());
    *fakes.sandbox.state.borrow_mut() = before.clone();

    let err = run_pipeline(&root, &fakes).expect_err("patch failure must abort");
    assert_eq!(err.kind(), "patch-failed");
    assert_eq!(err.exit_code(), 22);
    assert!(err.to_string().contains("widevine-fixup"));

    assert!(!layout_for(&root).install_root().exists());
    assert!(!layout_for(&root).pref_path().exists());
    assert_eq!(fakes.sandbox.applied.get(), 0);
    assert_eq!(*fakes.sandbox.state.borrow(), before);
    assert!(workspace_entries(&root).is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn fetch_failure_cleans_workspace_and_installs_nothing() {
    let root = test_root("fetch-fail");
    let fakes = Fakes {
        fetcher: FakeFetcher {
            fail: true,
            ..FakeFetcher::default()
        },
        ..Fakes::healthy()
    };

    let err = run_pipeline(&root, &fakes).expect_err("fetch failure must abort");
    assert_eq!(err.kind(), "fetch-failed");
    assert!(err.to_string().contains("HTTP 404"));
    assert_eq!(fakes.fetcher.calls.get(), 1, "no retries");
    assert!(workspace_entries(&root).is_empty());
    assert!(!layout_for(&root).app_root().exists());
    assert_eq!(fakes.sandbox.applied.get(), 0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn empty_extraction_is_an_extract_failure() {
    let root = test_root("extract-fail");
    let fakes = Fakes {
        extractor: FakeExtractor {
            produce_payload: false,
        },
        ..Fakes::healthy()
    };

    let err = run_pipeline(&root, &fakes).expect_err("must abort");
    assert_eq!(err.kind(), "extract-failed");
    assert_eq!(err.exit_code(), 21);
    assert_eq!(fakes.prompt.asked.get(), 1, "license gate is never reached");
    assert!(workspace_entries(&root).is_empty());
    assert!(!layout_for(&root).app_root().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn cancelling_intent_gate_skips_download() {
    let root = test_root("cancel-intent");
    let fakes = Fakes {
        prompt: ScriptedPrompt::new(&[Decision::Cancel]),
        ..Fakes::healthy()
    };

    let err = run_pipeline(&root, &fakes).expect_err("must cancel");
    assert_eq!(err, ProvisionError::Cancelled);
    assert_eq!(err.exit_code(), 130);
    assert_eq!(fakes.fetcher.calls.get(), 0);
    assert!(workspace_entries(&root).is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn cancelling_license_gate_installs_nothing() {
    let root = test_root("cancel-license");
    let fakes = Fakes {
        prompt: ScriptedPrompt::new(&[Decision::Proceed, Decision::Cancel]),
        ..Fakes::healthy()
    };

    let err = run_pipeline(&root, &fakes).expect_err("must cancel");
    assert_eq!(err, ProvisionError::Cancelled);
    assert_eq!(fakes.fetcher.calls.get(), 1);
    assert_eq!(fakes.sandbox.applied.get(), 0);
    assert!(workspace_entries(&root).is_empty());
    assert!(!layout_for(&root).app_root().exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unreadable_prompt_counts_as_cancel() {
    let root = test_root("cancel-error");
    let fakes = Fakes {
        prompt: ScriptedPrompt::new(&[]),
        ..Fakes::healthy()
    };

    let err = run_pipeline(&root, &fakes).expect_err("must cancel");
    assert_eq!(err, ProvisionError::Cancelled);
    assert!(workspace_entries(&root).is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn sandbox_failure_is_reported_after_placement() {
    let root = test_root("sandbox-fail");
    let fakes = Fakes {
        sandbox: MemorySandbox {
            fail_apply: true,
            ..MemorySandbox::default()
        },
        ..Fakes::healthy()
    };

    let err = run_pipeline(&root, &fakes).expect_err("must fail");
    assert_eq!(err.kind(), "sandbox-failed");
    assert_eq!(err.exit_code(), 24);
    assert!(layout_for(&root).library_path().is_file());
    assert!(!layout_for(&root).pref_path().exists());
    assert!(workspace_entries(&root).is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn copy_with_progress_reports_running_total() {
    let payload = vec![7_u8; 150_000];
    let mut reader = Cursor::new(payload.clone());
    let mut sink = Vec::new();
    let mut reported = Vec::new();

    let written = copy_with_progress(&mut reader, &mut sink, Some(150_000), |total| {
        reported.push(total)
    })
    .expect("must copy");

    assert_eq!(written, 150_000);
    assert_eq!(sink, payload);
    assert_eq!(reported.last().copied(), Some(150_000));
    assert!(reported.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn copy_with_progress_rejects_truncated_stream() {
    let mut reader = Cursor::new(vec![1_u8; 10]);
    let mut sink = Vec::new();
    let err = copy_with_progress(&mut reader, &mut sink, Some(20), |_| {})
        .expect_err("short stream must fail");
    assert!(err.to_string().contains("received 10 of 20 bytes"));
}

#[test]
fn copy_with_progress_accepts_unknown_length() {
    let mut reader = Cursor::new(vec![1_u8; 10]);
    let mut sink = Vec::new();
    let written = copy_with_progress(&mut reader, &mut sink, None, |_| {}).expect("must copy");
    assert_eq!(written, 10);
}

#[test]
fn partial_download_is_discarded_once_and_missing_file_is_tolerated() {
    let root = test_root("part");
    let part = root.join("lacros.squashfs.part");
    fs::write(&part, b"half an image").expect("must write part file");

    discard_partial_download(&part);
    assert!(!part.exists());
    discard_partial_download(&part);
    assert!(!part.exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn key_decisions_map_ctrl_c_and_escape_to_cancel() {
    let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
    let escape = KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE);
    let enter = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
    let plain_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE);

    assert_eq!(decision_for_key(&ctrl_c), Decision::Cancel);
    assert_eq!(decision_for_key(&escape), Decision::Cancel);
    assert_eq!(decision_for_key(&enter), Decision::Proceed);
    assert_eq!(decision_for_key(&plain_c), Decision::Proceed);
}

#[test]
fn line_decision_treats_eof_as_cancel() {
    assert_eq!(decision_for_line(0), Decision::Cancel);
    assert_eq!(decision_for_line(1), Decision::Proceed);
}

#[test]
fn plain_rendering_has_no_escape_codes() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "fetch", "https://example.test/a"),
        "fetch: https://example.test/a"
    );
    assert!(render_transfer_line(
        OutputStyle::Plain,
        "download",
        10,
        Some(10),
        std::time::Duration::from_millis(5)
    )
    .is_none());
    let rich = render_transfer_line(
        OutputStyle::Rich,
        "download",
        1024,
        Some(1024),
        std::time::Duration::from_millis(1500),
    )
    .expect("rich line");
    assert!(rich.contains("complete in 1.500s"));
}

#[cfg(unix)]
#[test]
fn report_lines_mention_warnings() {
    let root = test_root("report");
    let fakes = Fakes::healthy();
    let mut report = run_pipeline(&root, &fakes).expect("pipeline must succeed");

    let clean = format_report_lines(&report);
    assert!(clean.iter().any(|line| line.contains("Restart Firefox")));

    report
        .warnings
        .push(widevine_flatpak_installer::VerificationWarning::OverrideQueryFailed(
            "flatpak missing".to_string(),
        ));
    let warned = format_report_lines(&report);
    assert!(warned.iter().any(|line| line.contains("1 warning(s)")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn exit_status_matches_error_class() {
    assert_eq!(exit_status_byte(&ProvisionError::Cancelled), 130);
    assert_eq!(
        exit_status_byte(&ProvisionError::ToolMissing {
            tool: "flatpak".to_string()
        }),
        13
    );
}

#[test]
fn cli_accepts_no_arguments_only() {
    assert!(Cli::try_parse_from(["widevine-flatpak"]).is_ok());
    assert!(Cli::try_parse_from(["widevine-flatpak", "--force"]).is_err());
}
