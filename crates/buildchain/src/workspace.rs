use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_build_dir() -> String {
    "_build".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            clean: CleanMode::None,
        }
    }
}

/// Where inputs are read from and artifacts are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Repository root: Dockerfiles, spec files, `packages/rpmlintrc`.
    pub root: PathBuf,
    pub build_root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, build_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            build_root: build_root.into(),
        }
    }

    /// Tree that ends up on the ISO.
    pub fn iso_root(&self) -> PathBuf {
        self.build_root.join("root")
    }

    pub fn iso_images_dir(&self) -> PathBuf {
        self.iso_root().join("images")
    }

    /// Markers for images that are built but not saved.
    pub fn image_markers_dir(&self) -> PathBuf {
        self.build_root.join("images")
    }

    /// Root for the packages we build ourselves.
    pub fn pkg_root(&self) -> PathBuf {
        self.build_root.join("packages")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.build_root.join(".buildchain")
    }

    pub fn error_logs_dir(&self) -> PathBuf {
        self.build_root.join("error-logs")
    }

    pub fn packages_src_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn spec_file(&self, package: &str) -> PathBuf {
        self.packages_src_dir().join(format!("{package}.spec"))
    }

    pub fn rpmlintrc(&self) -> PathBuf {
        self.packages_src_dir().join("rpmlintrc")
    }

    pub fn entrypoint(&self) -> PathBuf {
        self.packages_src_dir().join("entrypoint.sh")
    }

    /// Absolute paths pass through; relative ones hang off the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("empty path"));
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.root.join(pb)
        })
    }
}

pub fn load_layout(cfg: &WorkspaceConfig, config_dir: &Path) -> Result<Layout> {
    let root = resolve_user_path(config_dir, &cfg.root_dir)?;
    let build_root = resolve_user_dir(&root, &cfg.build_dir)?;
    Ok(Layout { root, build_root })
}

pub fn init_dirs(cfg: &WorkspaceConfig, layout: &Layout) -> Result<()> {
    if cfg.clean == CleanMode::Build {
        safe_remove_dir_all(&layout.root, &layout.build_root)?;
    }
    fs::create_dir_all(&layout.build_root).map_err(|e| {
        Error::io(format!(
            "failed to create build_dir {}: {e}",
            layout.build_root.display()
        ))
    })
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    let rel = Path::new(p);
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::msg(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    Ok(if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        root.join(rel)
    })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    let joined = if pb.is_absolute() { pb } else { base.join(pb) };
    Ok(crate::fsutil::normalize(&joined))
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not below workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::io(format!("failed to remove dir {}: {e}", dir_can.display())))
}
