use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::render::TerminalRenderer;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("widevine-flatpak/", env!("CARGO_PKG_VERSION"));
const COPY_BUFFER_LEN: usize = 64 * 1024;

/// Retrieves one remote file into `dest`, returning the number of bytes written.
pub(crate) trait ArchiveFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Single-attempt HTTP download with a progress bar.
pub(crate) struct HttpFetcher {
    renderer: TerminalRenderer,
}

impl HttpFetcher {
    pub(crate) fn new(renderer: TerminalRenderer) -> Self {
        Self { renderer }
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let client = build_http_client()?;
        debug!(url, dest = %dest.display(), "starting download");

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("HTTP request failed for {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("server responded with HTTP {status}"));
        }

        let expected_len = response.content_length();
        let part_path = part_path_for(dest);
        let file = File::create(&part_path)
            .with_context(|| format!("failed to create {}", part_path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut progress = self.renderer.start_transfer("download", expected_len);
        let copied = copy_with_progress(&mut response, &mut writer, expected_len, |written| {
            progress.set(written)
        })
        .and_then(|written| {
            writer
                .flush()
                .with_context(|| format!("failed to flush {}", part_path.display()))?;
            Ok(written)
        });

        let written = match copied {
            Ok(written) => {
                progress.finish_success();
                written
            }
            Err(err) => {
                progress.finish_abandon();
                drop(writer);
                discard_partial_download(&part_path);
                return Err(err);
            }
        };
        drop(writer);

        fs::rename(&part_path, dest).with_context(|| {
            format!(
                "failed to move {} to {}",
                part_path.display(),
                dest.display()
            )
        })?;
        info!(url, bytes = written, "download complete");
        Ok(written)
    }
}

fn build_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(None::<Duration>)
        .build()
        .context("failed to build HTTP client")
}

fn part_path_for(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{file_name}.part"))
}

pub(crate) fn discard_partial_download(part_path: &Path) {
    match fs::remove_file(part_path) {
        Ok(()) => debug!(path = %part_path.display(), "partial download removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            path = %part_path.display(),
            "failed to remove partial download: {err}"
        ),
    }
}

/// Copies `reader` to `writer`, reporting the running byte count, and fails
/// when the stream ends short of `expected_len`.
pub(crate) fn copy_with_progress<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    expected_len: Option<u64>,
    mut on_progress: F,
) -> Result<u64>
where
    R: Read,
    W: Write,
    F: FnMut(u64),
{
    let mut buffer = vec![0_u8; COPY_BUFFER_LEN];
    let mut written = 0_u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("transfer interrupted after {written} bytes")
                });
            }
        };
        writer
            .write_all(&buffer[..read])
            .context("failed to write downloaded bytes")?;
        written += read as u64;
        on_progress(written);
    }

    if let Some(expected) = expected_len {
        if written != expected {
            return Err(anyhow!(
                "truncated transfer: received {written} of {expected} bytes"
            ));
        }
    }
    Ok(written)
}
