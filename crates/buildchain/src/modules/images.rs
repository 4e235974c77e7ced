use crate::config::{ConfigDoc, ImageConfig};
use crate::error::{Error, Result};
use crate::modules::{Module, Project};
use crate::planner::Plan;
use crate::targets::{BuildTarget, LocalImage};

pub struct ImagesModule;

impl Module for ImagesModule {
    fn id(&self) -> &'static str {
        "images"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table("images")
    }

    fn plan(&self, project: &Project, plan: &mut Plan) -> Result<()> {
        for name in project.entries("images") {
            let image = project.image(&name)?;
            plan.extend(image.tasks()?)?;
        }
        Ok(())
    }
}

pub(crate) fn local_image(project: &Project, name: &str, cfg: ImageConfig) -> Result<LocalImage> {
    if cfg.version.trim().is_empty() {
        return Err(Error::msg(format!("images.{name}.version is required")));
    }
    if cfg.dockerfile.trim().is_empty() {
        return Err(Error::msg(format!("images.{name}.dockerfile is required")));
    }
    let layout = &project.env.layout;

    let mut image = LocalImage::new(
        &project.env,
        name,
        project.expand(&cfg.version)?,
        layout.resolve(&cfg.dockerfile)?,
    )
    .save_on_disk(cfg.save_on_disk)
    .with_build_args(cfg.build_args);

    let deps = cfg
        .file_dep
        .iter()
        .map(|raw| layout.resolve(raw))
        .collect::<Result<Vec<_>>>()?;
    image = image.with_file_dep(deps);

    if let Some(dest) = cfg.destination.as_deref() {
        image = image.with_destination(layout.resolve(&project.expand(dest)?)?);
    }
    Ok(image)
}
