use crate::config::{ConfigDoc, PackageConfig};
use crate::error::{Error, Result};
use crate::modules::{Module, Project};
use crate::planner::Plan;
use crate::targets::{BuildTarget, Package};

pub struct PackagesModule;

impl Module for PackagesModule {
    fn id(&self) -> &'static str {
        "packages"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table("packages")
    }

    fn plan(&self, project: &Project, plan: &mut Plan) -> Result<()> {
        for name in project.entries("packages") {
            let cfg: PackageConfig = project.entry("packages", &name)?;
            plan.extend(package(project, &name, cfg)?.tasks()?)?;
        }
        Ok(())
    }
}

pub(crate) fn package(project: &Project, name: &str, cfg: PackageConfig) -> Result<Package> {
    if cfg.version.trim().is_empty() {
        return Err(Error::msg(format!("packages.{name}.version is required")));
    }
    if let Some(bad) = cfg
        .sources
        .iter()
        .find(|s| s.trim().is_empty() || s.contains('/'))
    {
        return Err(Error::msg(format!(
            "packages.{name}.sources: '{bad}' must be a plain file name"
        )));
    }
    let builder_name = cfg
        .builder
        .as_deref()
        .or(project.build.builder.as_deref())
        .ok_or_else(|| {
            Error::msg(format!(
                "package '{name}' has no builder image (set packages.{name}.builder or build.builder)"
            ))
        })?;
    let builder = project
        .image(builder_name)
        .map_err(|e| e.context(format!("builder for package '{name}'")))?;

    let mut pkg = Package::new(
        &project.env,
        name,
        project.expand(&cfg.version)?,
        cfg.build_id,
        cfg.sources,
        &builder,
    );
    if let Some(spec) = cfg.spec.as_deref() {
        pkg = pkg.with_spec(project.env.layout.resolve(spec)?);
    }
    Ok(pkg)
}
