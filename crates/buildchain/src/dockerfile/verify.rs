use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::dockerfile::DependencySet;
use crate::error::{Error, Result};
use crate::fsutil::normalize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub line: usize,
    pub text: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    dockerfile: PathBuf,
    missing: Vec<MissingDependency>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn missing(&self) -> &[MissingDependency] {
        &self.missing
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_clean() {
            return Ok(());
        }
        Err(Error::dependency(self.to_string()))
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "{}: all inputs declared", self.dockerfile.display());
        }
        write!(
            f,
            "{} uses {} undeclared input(s):",
            self.dockerfile.display(),
            self.missing.len()
        )?;
        for m in &self.missing {
            write!(f, "\n  line {} `{}`: {}", m.line, m.text, m.path.display())?;
        }
        Ok(())
    }
}

/// Report every resolved input absent from `declared`.
pub fn verify<P: AsRef<Path>>(set: &DependencySet, declared: &[P]) -> VerificationReport {
    let declared: BTreeSet<PathBuf> = declared.iter().map(|p| normalize(p.as_ref())).collect();
    let missing = set
        .iter()
        .filter(|dep| !declared.contains(&normalize(dep.path())))
        .map(|dep| {
            let directive = set.directive_of(dep);
            MissingDependency {
                line: directive.line(),
                text: directive.text().to_string(),
                path: dep.path().to_path_buf(),
            }
        })
        .collect();
    VerificationReport {
        dockerfile: set.dockerfile().to_path_buf(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;

    fn context() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("conf")).unwrap();
        fs::write(tmp.path().join("app.py"), b"").unwrap();
        fs::write(tmp.path().join("conf/a.yaml"), b"").unwrap();
        fs::write(tmp.path().join("conf/b.yaml"), b"").unwrap();
        let dockerfile = tmp.path().join("Dockerfile");
        fs::write(
            &dockerfile,
            "FROM centos:7\nCOPY app.py /app/app.py\nCOPY conf/ /etc/app/\n",
        )
        .unwrap();
        (tmp, dockerfile)
    }

    #[test]
    fn fully_declared_is_clean() {
        let (tmp, dockerfile) = context();
        let set = crate::dockerfile::extract(&dockerfile).unwrap();
        let declared = vec![
            dockerfile.clone(),
            tmp.path().join("app.py"),
            tmp.path().join("./conf/a.yaml"),
            tmp.path().join("conf/b.yaml"),
        ];
        let report = verify(&set, &declared);
        assert!(report.is_clean(), "{report}");
        report.into_result().unwrap();
    }

    #[test]
    fn dropping_any_one_input_reports_exactly_that_input() {
        let (tmp, dockerfile) = context();
        let set = crate::dockerfile::extract(&dockerfile).unwrap();
        let all = vec![
            tmp.path().join("app.py"),
            tmp.path().join("conf/a.yaml"),
            tmp.path().join("conf/b.yaml"),
        ];
        for skip in 0..all.len() {
            let declared: Vec<&PathBuf> = all
                .iter()
                .enumerate()
                .filter_map(|(i, p)| (i != skip).then_some(p))
                .collect();
            let report = verify(&set, &declared);
            assert_eq!(report.missing().len(), 1);
            assert_eq!(report.missing()[0].path, all[skip]);
        }
    }

    #[test]
    fn failure_message_names_line_text_and_path() {
        let (tmp, dockerfile) = context();
        let set = crate::dockerfile::extract(&dockerfile).unwrap();
        let declared = vec![tmp.path().join("conf/a.yaml"), tmp.path().join("conf/b.yaml")];
        let err = verify(&set, &declared).into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyDeclaration);
        let msg = err.to_string();
        assert!(msg.contains("line 2 `COPY app.py /app/app.py`"), "{msg}");
        assert!(msg.contains(&tmp.path().join("app.py").display().to_string()));
    }
}
