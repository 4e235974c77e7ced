//! Source download plans read from `rpmspec -P` output.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

fn source_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Source\d+:\s+(?P<url>.+)$").expect("source pattern compiles"))
}

/// Local source filename -> download URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePlan {
    urls: BTreeMap<String, String>,
}

impl SourcePlan {
    /// Match every expected filename to a `SourceN:` line of `meta`.
    ///
    /// A filename that no line accounts for fails the whole plan.
    pub fn from_meta<S: AsRef<str>>(meta: &str, expected: &[S]) -> Result<Self> {
        let re = source_url_re();
        let mut pending: BTreeSet<&str> = expected.iter().map(|s| s.as_ref()).collect();
        let mut urls = BTreeMap::new();

        for line in meta.lines() {
            let Some(caps) = re.captures(line) else {
                continue;
            };
            let url = caps["url"].trim();
            let filename = file_from_url(url);
            if pending.remove(filename.as_str()) {
                urls.insert(filename, url.to_string());
            }
        }

        if !pending.is_empty() {
            let names: Vec<&str> = pending.into_iter().collect();
            return Err(Error::metadata(format!(
                "URL not found for source files: {}",
                names.join(", ")
            )));
        }
        Ok(Self { urls })
    }

    pub fn from_meta_file<S: AsRef<str>>(meta: &Path, expected: &[S]) -> Result<Self> {
        let text = fs::read_to_string(meta)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", meta.display())))?;
        Self::from_meta(&text, expected).map_err(|e| e.context(meta.display()))
    }

    pub fn url(&self, filename: &str) -> Option<&str> {
        self.urls.get(filename).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.urls.iter().map(|(f, u)| (f.as_str(), u.as_str()))
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Percent-decoded last path segment of `url`.
pub fn file_from_url(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let last = path.rsplit('/').next().unwrap_or_default();
    urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const META: &str = "\
Name:           calico-cni-plugin
Version:        3.5.1
Source0:        https://github.com/projectcalico/cni-plugin/archive/v3.5.1.tar.gz
Source1:        https://example.org/dl/calico%2Damd64?raw=1
Source12: https://example.org/patch.diff
URL:            https://example.org/Source3: not-a-source
";

    #[test]
    fn maps_filenames_to_urls() {
        let plan = SourcePlan::from_meta(META, &["v3.5.1.tar.gz", "calico-amd64"]).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.url("v3.5.1.tar.gz"),
            Some("https://github.com/projectcalico/cni-plugin/archive/v3.5.1.tar.gz")
        );
        assert_eq!(
            plan.url("calico-amd64"),
            Some("https://example.org/dl/calico%2Damd64?raw=1")
        );
    }

    #[test]
    fn single_source_line() {
        let plan = SourcePlan::from_meta("Source0: http://x/a.tgz\n", &["a.tgz"]).unwrap();
        assert_eq!(plan.url("a.tgz"), Some("http://x/a.tgz"));
    }

    #[test]
    fn unmatched_filenames_are_all_named() {
        let err = SourcePlan::from_meta(META, &["patch.diff", "zeta.tgz", "alpha.tgz"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataIncomplete);
        assert_eq!(
            err.to_string(),
            "URL not found for source files: alpha.tgz, zeta.tgz"
        );
    }

    #[test]
    fn line_order_does_not_change_the_plan() {
        let expected = ["v3.5.1.tar.gz", "calico-amd64", "patch.diff"];
        let forward = SourcePlan::from_meta(META, &expected).unwrap();
        let reversed: String = META.lines().rev().map(|l| format!("{l}\n")).collect();
        let backward = SourcePlan::from_meta(&reversed, &expected).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn filename_from_plain_path() {
        assert_eq!(file_from_url("sources/pkg-1.0.tar.gz"), "pkg-1.0.tar.gz");
        assert_eq!(file_from_url("https://h/a%20b.tgz#frag"), "a b.tgz");
    }
}
