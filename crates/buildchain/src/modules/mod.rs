use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::config::{BuildMeta, ConfigDoc, ImageConfig};
use crate::engine::ContainerEngine;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::planner::Plan;
use crate::targets::{BuildEnv, LocalImage};
use crate::version::ProductVersion;
use crate::workspace::{self, WorkspaceConfig};

pub mod images;
pub mod packages;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, project: &Project, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(images::ImagesModule),
        Box::new(packages::PackagesModule),
    ]
}

/// A loaded build definition plus the capabilities its targets run with.
pub struct Project {
    pub doc: ConfigDoc,
    pub workspace: WorkspaceConfig,
    pub build: BuildMeta,
    pub env: BuildEnv,
    version: Option<ProductVersion>,
}

impl Project {
    pub fn open(
        doc: ConfigDoc,
        engine: Arc<dyn ContainerEngine>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let workspace: WorkspaceConfig = doc.section("workspace")?;
        let build: BuildMeta = doc.section("build")?;
        let config_dir = doc
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let layout = workspace::load_layout(&workspace, config_dir)?;
        let version = match build.version_file.as_deref() {
            Some(raw) => Some(ProductVersion::load(&layout.resolve(raw)?)?),
            None => None,
        };
        Ok(Self {
            doc,
            workspace,
            build,
            env: BuildEnv::new(layout, engine, fetcher),
            version,
        })
    }

    pub fn version(&self) -> Option<&ProductVersion> {
        self.version.as_ref()
    }

    /// Substitute `{version}` / `{short_version}` when a VERSION file is set.
    pub fn expand(&self, raw: &str) -> Result<String> {
        match &self.version {
            Some(v) => Ok(v.expand(raw)),
            None if raw.contains("{version}") || raw.contains("{short_version}") => {
                Err(Error::msg(format!(
                    "'{raw}' uses a version placeholder but [build].version_file is not set"
                )))
            }
            None => Ok(raw.to_string()),
        }
    }

    /// Names under `[<table>]`, sorted.
    pub fn entries(&self, table: &str) -> Vec<String> {
        self.doc
            .table(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// `[<table>.<name>]`, read directly so names may contain dots.
    pub fn entry<T: DeserializeOwned>(&self, table: &str, name: &str) -> Result<T> {
        let value = self
            .doc
            .table(table)
            .and_then(|t| t.get(name))
            .ok_or_else(|| Error::msg(format!("unknown entry '{name}' in [{table}]")))?;
        value
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("invalid config for {table}.{name}: {e}")))
    }

    pub fn image(&self, name: &str) -> Result<LocalImage> {
        let cfg: ImageConfig = self.entry("images", name)?;
        images::local_image(self, name, cfg)
    }
}

/// Run every detected module against `project`.
pub fn build_plan(project: &Project) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(&project.doc) {
            tracing::debug!(module = m.id(), "planning");
            m.plan(project, &mut plan)?;
        }
    }
    Ok(plan)
}
