mod fetch;
mod pipeline;
mod preflight;
mod prompt;
mod render;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use widevine_flatpak_core::{ProvisionConfig, ProvisionError};
use widevine_flatpak_installer::{
    default_home_dir, CleanupSlot, FlatpakOverrideStore, SquashfsExtractor,
    SubprocessTransformer,
};

use crate::fetch::HttpFetcher;
use crate::pipeline::{Collaborators, Pipeline, ProvisionReport};
use crate::preflight::SystemProbe;
use crate::prompt::TerminalPrompt;
use crate::render::TerminalRenderer;

const LOG_ENV: &str = "WIDEVINE_FLATPAK_LOG";

#[derive(Parser, Debug)]
#[command(name = "widevine-flatpak")]
#[command(version)]
#[command(
    about = "Install the Widevine CDM into the Flatpak build of Firefox on aarch64",
    long_about = None
)]
struct Cli {}

fn main() -> ExitCode {
    let _cli = Cli::parse();
    init_tracing();

    let renderer = TerminalRenderer::current();
    match run(renderer) {
        Ok(report) => {
            renderer.print_lines(&format_report_lines(&report));
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::debug!(kind = err.kind(), "provisioning failed");
            renderer.print_error(&err.to_string());
            ExitCode::from(exit_status_byte(&err))
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

fn run(renderer: TerminalRenderer) -> Result<ProvisionReport, ProvisionError> {
    let config = ProvisionConfig::pinned();
    let home = default_home_dir().map_err(|err| ProvisionError::ConfigInvalid {
        detail: format!("{err:#}"),
    })?;

    let cleanup = CleanupSlot::new();
    install_interrupt_handler(&cleanup)?;

    let probe = SystemProbe;
    let prompt = TerminalPrompt;
    let fetcher = HttpFetcher::new(renderer);
    let extractor = SquashfsExtractor;
    let transformer = SubprocessTransformer::new(config.patcher_program.clone());
    let sandbox = FlatpakOverrideStore;

    let pipeline = Pipeline::new(
        config,
        &home,
        cleanup,
        renderer,
        Collaborators {
            probe: &probe,
            prompt: &prompt,
            fetcher: &fetcher,
            extractor: &extractor,
            transformer: &transformer,
            sandbox: &sandbox,
        },
    );
    pipeline.run()
}

/// SIGINT/SIGTERM remove the workspace before the process exits.
fn install_interrupt_handler(cleanup: &CleanupSlot) -> Result<(), ProvisionError> {
    let slot = cleanup.clone();
    ctrlc::set_handler(move || {
        if let Err(err) = slot.release() {
            eprintln!("failed to clean up workspace: {err:#}");
        }
        eprintln!();
        std::process::exit(ProvisionError::Cancelled.exit_code());
    })
    .map_err(|err| ProvisionError::ConfigInvalid {
        detail: format!("failed to install interrupt handler: {err}"),
    })
}

fn exit_status_byte(err: &ProvisionError) -> u8 {
    u8::try_from(err.exit_code()).unwrap_or(1)
}

fn format_report_lines(report: &ProvisionReport) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        format!("Widevine CDM installed to {}", report.bundle.dir.display()),
        format!("Preferences written to {}", report.pref_path.display()),
        format!(
            "See {} for details and uninstall steps.",
            report.readme_path.display()
        ),
    ];
    if report.warnings.is_empty() {
        lines.push("Restart Firefox to load the plugin.".to_string());
    } else {
        lines.push(format!(
            "Installation finished with {} warning(s); the plugin may not load.",
            report.warnings.len()
        ));
    }
    lines
}

#[cfg(test)]
mod tests;
