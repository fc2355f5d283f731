use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use semver::Version;

/// glibc-style `major.minor[.patch]` version compared numerically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkerVersion(Version);

impl LinkerVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// Extracts the version from `ldd --version` output.
    ///
    /// The version is the last token of the first line, e.g.
    /// `ldd (Debian GLIBC 2.36-9+deb12u4) 2.36`.
    pub fn from_ldd_output(output: &str) -> Result<Self> {
        let first_line = output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("ldd --version printed nothing"))?;
        let token = first_line
            .split_whitespace()
            .last()
            .ok_or_else(|| anyhow!("ldd --version first line is empty"))?;
        token
            .parse()
            .with_context(|| format!("unrecognized ldd version line: '{first_line}'"))
    }

    pub fn satisfies_minimum(&self, minimum: &LinkerVersion) -> bool {
        self >= minimum
    }
}

impl FromStr for LinkerVersion {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        // distro suffixes like `2.39-4` or `2.38+git` are not part of the comparison
        let numeric = trimmed
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or_default()
            .trim_matches('.');
        if numeric.is_empty() {
            return Err(anyhow!("version '{trimmed}' has no numeric component"));
        }

        let mut parts = Vec::new();
        for part in numeric.split('.') {
            let value = part
                .parse::<u64>()
                .with_context(|| format!("invalid version component '{part}' in '{trimmed}'"))?;
            parts.push(value);
        }
        if parts.len() > 3 {
            return Err(anyhow!(
                "version '{trimmed}' has more than three numeric components"
            ));
        }
        parts.resize(3, 0);

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for LinkerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.patch == 0 {
            write!(f, "{}.{}", self.0.major, self.0.minor)
        } else {
            write!(f, "{}", self.0)
        }
    }
}
