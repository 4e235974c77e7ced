use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const KEYS: [&str; 4] = [
    "VERSION_MAJOR",
    "VERSION_MINOR",
    "VERSION_PATCH",
    "VERSION_SUFFIX",
];

/// Product version read from a `VERSION` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductVersion {
    major: String,
    minor: String,
    patch: String,
    suffix: String,
}

impl ProductVersion {
    pub fn parse(text: &str) -> Result<Self> {
        let mut found = BTreeMap::<&str, String>::new();
        for line in text.lines() {
            let (name, value) = line.trim().split_once('=').unwrap_or((line.trim(), ""));
            // Anything else in the file is ignored, never interpreted.
            if let Some(key) = KEYS.iter().find(|k| **k == name.trim()) {
                found.insert(*key, value.trim().to_string());
            }
        }
        let mut take = |key: &str| {
            found
                .remove(key)
                .ok_or_else(|| Error::msg(format!("VERSION file does not define {key}")))
        };
        Ok(Self {
            major: take("VERSION_MAJOR")?,
            minor: take("VERSION_MINOR")?,
            patch: take("VERSION_PATCH")?,
            suffix: take("VERSION_SUFFIX")?,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&text).map_err(|e| e.context(path.display()))
    }

    /// `MAJOR.MINOR`
    pub fn short(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// `MAJOR.MINOR.PATCH` followed by the suffix.
    pub fn full(&self) -> String {
        format!("{}.{}{}", self.short(), self.patch, self.suffix)
    }

    pub fn expand(&self, raw: &str) -> String {
        raw.replace("{short_version}", &self.short())
            .replace("{version}", &self.full())
    }
}
