//! Dockerfile input discovery.
//!
//! Only single-source `COPY`/`ADD` directives are recognised. Each directive's
//! source is expanded into the regular files it pulls into the build, so the
//! image task can check them against its declared `file_dep`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

pub mod expand;
pub mod verify;

pub use expand::expand;
pub use verify::{MissingDependency, VerificationReport, verify};

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?i:COPY|ADD)(?P<flags>(?:\s+--\S+)*)\s+(?P<src>\S+)\s+(?P<dst>\S+)\s*$",
        )
        .expect("directive pattern compiles")
    })
}

/// One `COPY`/`ADD` line of a Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDirective {
    line: usize,
    text: String,
    flags: Vec<String>,
    source: String,
    destination: String,
}

impl BuildDirective {
    /// 1-based line number in the raw file.
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    // `--from=<stage>` copies out of another image, and ADD accepts URLs:
    // neither reads the build context.
    fn reads_context(&self) -> bool {
        !self.flags.iter().any(|f| f.starts_with("--from=")) && !self.source.contains("://")
    }
}

pub fn parse_directives(text: &str) -> Vec<BuildDirective> {
    let re = directive_re();
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let Some(caps) = re.captures(raw) else {
            continue;
        };
        let source = caps["src"].to_string();
        // JSON array form: `COPY ["a", "b"]`.
        if source.starts_with('[') {
            continue;
        }
        out.push(BuildDirective {
            line: idx + 1,
            text: raw.trim_end().to_string(),
            flags: caps["flags"]
                .split_whitespace()
                .map(ToOwned::to_owned)
                .collect(),
            source,
            destination: caps["dst"].to_string(),
        });
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    directive: usize,
    path: PathBuf,
}

impl ResolvedDependency {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Every file a Dockerfile pulls from its build context.
///
/// A path required by several directives appears once per directive.
#[derive(Debug, Clone)]
pub struct DependencySet {
    dockerfile: PathBuf,
    directives: Vec<BuildDirective>,
    deps: Vec<ResolvedDependency>,
}

impl DependencySet {
    pub fn resolve(dockerfile: &Path, text: &str) -> Self {
        let base = crate::fsutil::parent_dir(dockerfile);
        let directives = parse_directives(text);
        let mut deps = Vec::new();
        for (idx, directive) in directives.iter().enumerate() {
            if !directive.reads_context() {
                continue;
            }
            for path in expand(base, directive.source()) {
                deps.push(ResolvedDependency {
                    directive: idx,
                    path,
                });
            }
        }
        Self {
            dockerfile: dockerfile.to_path_buf(),
            directives,
            deps,
        }
    }

    pub fn dockerfile(&self) -> &Path {
        &self.dockerfile
    }

    pub fn directives(&self) -> &[BuildDirective] {
        &self.directives
    }

    pub fn directive_of(&self, dep: &ResolvedDependency) -> &BuildDirective {
        &self.directives[dep.directive]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.deps.iter()
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

/// Read a Dockerfile and resolve its context inputs.
pub fn extract(dockerfile: &Path) -> Result<DependencySet> {
    let text = fs::read_to_string(dockerfile).map_err(|e| {
        Error::io(format!(
            "failed to read Dockerfile {}: {e}",
            dockerfile.display()
        ))
    })?;
    Ok(DependencySet::resolve(dockerfile, &text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_copy_and_add_with_flags() {
        let text = "FROM centos:7\n\
                    COPY app.py /app/app.py\n\
                    RUN true\n\
                    ADD --chown=1000:1000 conf/ /etc/app/\n";
        let got = parse_directives(text);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].line(), 2);
        assert_eq!(got[0].text(), "COPY app.py /app/app.py");
        assert_eq!(got[0].source(), "app.py");
        assert_eq!(got[0].destination(), "/app/app.py");
        assert_eq!(got[1].line(), 4);
        assert_eq!(got[1].flags(), ["--chown=1000:1000"]);
        assert_eq!(got[1].source(), "conf/");
    }

    #[test]
    fn skips_multi_source_and_json_forms() {
        let text = "COPY a b /dst/\nCOPY [\"a\", \"/b\"]\nCOPY only-one\n";
        assert!(parse_directives(text).is_empty());
    }

    #[test]
    fn ignores_lines_that_merely_mention_keywords() {
        let text = "RUN echo COPY a b\n# COPY x y\nCOPYRIGHT a b\n";
        assert!(parse_directives(text).is_empty());
    }

    #[test]
    fn stage_and_url_sources_do_not_resolve_against_context() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("bin"), b"").unwrap();
        let dockerfile = tmp.path().join("Dockerfile");
        let set = DependencySet::resolve(
            &dockerfile,
            "COPY --from=builder bin /usr/bin/x\nADD https://example.org/bin /bin\n",
        );
        assert_eq!(set.directives().len(), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn bare_dockerfile_globs_from_the_working_directory() {
        let set = DependencySet::resolve(Path::new("Dockerfile"), "COPY Cargo.* /x\n");
        let paths: Vec<&Path> = set.iter().map(|d| d.path()).collect();
        assert!(paths.contains(&Path::new("Cargo.toml")), "{paths:?}");
    }

    #[test]
    fn same_file_is_kept_per_directive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.txt"), b"").unwrap();
        let dockerfile = tmp.path().join("Dockerfile");
        let set = DependencySet::resolve(&dockerfile, "COPY a.txt /a\nCOPY . /src\n");
        let lines: Vec<usize> = set.iter().map(|d| set.directive_of(d).line()).collect();
        assert_eq!(lines, vec![1, 2]);
        assert!(set.iter().all(|d| d.path() == tmp.path().join("a.txt")));
    }
}
