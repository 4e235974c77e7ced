//! Container engine capability used by image and package targets.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::executor::ExecCtx;

pub mod cli;

pub use cli::CliEngine;

/// Everything `build` needs; the context directory is the Dockerfile's parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub tag: String,
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub build_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn bind_ro(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::bind(source, target)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    /// Container path -> mount options (empty for defaults).
    pub tmpfs: BTreeMap<String, String>,
    pub read_only: bool,
    pub hostname: Option<String>,
    pub remove: bool,
}

impl RunRequest {
    /// Base configuration shared by every run in a builder image.
    ///
    /// The entrypoint script is mounted read-only and receives the caller's
    /// effective uid/gid so files it writes back are owned by the caller.
    pub fn builder(image: impl Into<String>, entrypoint: &Path) -> Self {
        let mut env = BTreeMap::new();
        let (uid, gid) = effective_ids();
        env.insert("TARGET_UID".to_string(), uid.to_string());
        env.insert("TARGET_GID".to_string(), gid.to_string());
        let mut tmpfs = BTreeMap::new();
        tmpfs.insert("/tmp".to_string(), String::new());
        Self {
            image: image.into(),
            command: Vec::new(),
            mounts: vec![Mount::bind_ro(entrypoint, "/entrypoint.sh")],
            env,
            tmpfs,
            read_only: false,
            hostname: Some("build".into()),
            remove: true,
        }
    }

    pub fn command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Append mounts and merge env/tmpfs; later keys win.
    pub fn expand(
        mut self,
        mounts: impl IntoIterator<Item = Mount>,
        env: impl IntoIterator<Item = (String, String)>,
        tmpfs: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.mounts.extend(mounts);
        self.env.extend(env);
        self.tmpfs.extend(tmpfs);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[cfg(unix)]
fn effective_ids() -> (u32, u32) {
    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };
    (uid, gid)
}

#[cfg(not(unix))]
fn effective_ids() -> (u32, u32) {
    (0, 0)
}

/// Synchronous container operations. Implementations hold no per-call state.
pub trait ContainerEngine: Send + Sync {
    fn build(&self, ctx: &ExecCtx, req: &BuildRequest) -> Result<()>;

    /// Stream `tag` as an image archive into `out`.
    fn save(&self, ctx: &ExecCtx, tag: &str, out: &mut dyn Write) -> Result<()>;

    fn run(&self, ctx: &ExecCtx, req: &RunRequest) -> Result<()>;

    /// Like `run`, returning the container's stdout.
    fn run_capture(&self, ctx: &ExecCtx, req: &RunRequest) -> Result<Vec<u8>>;
}
