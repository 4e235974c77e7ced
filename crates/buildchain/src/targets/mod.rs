//! Build targets: each one expands into an ordered list of tasks.

use std::path::Path;
use std::sync::Arc;

use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::planner::Task;
use crate::workspace::Layout;

pub mod image;
pub mod package;

pub use image::LocalImage;
pub use package::{BuilderMountSet, Package};

/// Width of the command column in task titles.
pub const CMD_WIDTH: usize = 12;

pub trait BuildTarget {
    fn name(&self) -> &str;

    /// Tasks in execution order.
    fn tasks(&self) -> Result<Vec<Task>>;
}

/// Capabilities shared by every target of one run.
#[derive(Clone)]
pub struct BuildEnv {
    pub layout: Layout,
    pub engine: Arc<dyn ContainerEngine>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl BuildEnv {
    pub fn new(layout: Layout, engine: Arc<dyn ContainerEngine>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            layout,
            engine,
            fetcher,
        }
    }
}

pub(crate) fn title(cmd: &str, what: impl std::fmt::Display) -> String {
    format!("{cmd:<width$} {what}", width = CMD_WIDTH)
}

/// Title naming a path relative to the build root when possible.
pub(crate) fn title_with_target(cmd: &str, build_root: &Path, target: &Path) -> String {
    let shown = target.strip_prefix(build_root).unwrap_or(target);
    title(cmd, shown.display())
}
