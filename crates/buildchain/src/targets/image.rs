use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{BuildEnv, BuildTarget, title};
use crate::dockerfile::{self, VerificationReport};
use crate::engine::{BuildRequest, ContainerEngine};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::fsutil;
use crate::planner::{Action, Task};

/// A container image built from a local Dockerfile.
///
/// The image is tagged `name:version` and either saved as a gzipped archive
/// or tracked by an empty marker file.
#[derive(Clone)]
pub struct LocalImage {
    name: String,
    version: String,
    dockerfile: PathBuf,
    destination: Option<PathBuf>,
    save_on_disk: bool,
    build_args: BTreeMap<String, String>,
    extra_deps: Vec<PathBuf>,
    iso_images_dir: PathBuf,
    markers_dir: PathBuf,
    engine: Arc<dyn ContainerEngine>,
}

impl LocalImage {
    pub fn new(
        env: &BuildEnv,
        name: impl Into<String>,
        version: impl Into<String>,
        dockerfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dockerfile: dockerfile.into(),
            destination: None,
            save_on_disk: false,
            build_args: BTreeMap::new(),
            extra_deps: Vec::new(),
            iso_images_dir: env.layout.iso_images_dir(),
            markers_dir: env.layout.image_markers_dir(),
            engine: env.engine.clone(),
        }
    }

    pub fn save_on_disk(mut self, save: bool) -> Self {
        self.save_on_disk = save;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_build_args(mut self, args: BTreeMap<String, String>) -> Self {
        self.build_args = args;
        self
    }

    /// Inputs the Dockerfile pulls from its context.
    pub fn with_file_dep(mut self, deps: impl IntoIterator<Item = PathBuf>) -> Self {
        self.extra_deps.extend(deps);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tag(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    pub fn dockerfile(&self) -> &Path {
        &self.dockerfile
    }

    pub fn build_args(&self) -> &BTreeMap<String, String> {
        &self.build_args
    }

    /// Archive path when saved, marker path otherwise.
    pub fn destination(&self) -> PathBuf {
        if let Some(dest) = &self.destination {
            return dest.clone();
        }
        let stem = format!("{}-{}", self.name, self.version);
        if self.save_on_disk {
            self.iso_images_dir.join(format!("{stem}.tar.gz"))
        } else {
            self.markers_dir.join(stem)
        }
    }

    /// Where `save` writes before compression.
    pub fn uncompressed_destination(&self) -> PathBuf {
        self.destination().with_extension("")
    }

    /// The Dockerfile followed by every declared input.
    pub fn file_dep(&self) -> Vec<PathBuf> {
        let mut deps = Vec::with_capacity(self.extra_deps.len() + 1);
        deps.push(self.dockerfile.clone());
        deps.extend(self.extra_deps.iter().cloned());
        deps
    }

    pub fn verify_dependencies(&self) -> Result<VerificationReport> {
        let set = dockerfile::extract(&self.dockerfile)?;
        Ok(dockerfile::verify(&set, &self.file_dep()))
    }

    fn build_request(&self) -> BuildRequest {
        BuildRequest {
            tag: self.tag(),
            context: fsutil::parent_dir(&self.dockerfile).to_path_buf(),
            dockerfile: self.dockerfile.clone(),
            build_args: self.build_args.clone(),
        }
    }

    fn save(&self, ctx: &ExecCtx) -> Result<()> {
        let tar = self.uncompressed_destination();
        match self.write_archive(ctx, &tar) {
            Ok(gz) => {
                tracing::info!(image = %self.tag(), path = %gz.display(), "image saved");
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tar)
                    && rm.kind() != io::ErrorKind::NotFound
                {
                    tracing::warn!(path = %tar.display(), error = %rm, "failed to remove partial archive");
                }
                Err(e)
            }
        }
    }

    fn write_archive(&self, ctx: &ExecCtx, tar: &Path) -> Result<PathBuf> {
        fsutil::ensure_dir(fsutil::parent_dir(tar))?;
        let file = File::create(tar)
            .map_err(|e| Error::io(format!("failed to create {}: {e}", tar.display())))?;
        let mut out = BufWriter::new(file);
        self.engine.save(ctx, &self.tag(), &mut out)?;
        out.flush()
            .map_err(|e| Error::io(format!("failed to write {}: {e}", tar.display())))?;
        drop(out);
        fsutil::gzip_in_place(tar)
    }
}

impl BuildTarget for LocalImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self) -> Result<Vec<Task>> {
        let destination = self.destination();
        if self.save_on_disk && destination.extension().is_none_or(|ext| ext != "gz") {
            return Err(Error::msg(format!(
                "image '{}': saved destination {} must end in .gz",
                self.name,
                destination.display()
            )));
        }

        let mut actions = Vec::new();
        let this = self.clone();
        actions.push(Action::new(
            format!("verify inputs of {}", self.dockerfile.display()),
            move |ctx| {
                let report = this.verify_dependencies()?;
                ctx.log(&report.to_string());
                report.into_result()
            },
        ));
        let this = self.clone();
        actions.push(Action::new(format!("build {}", self.tag()), move |ctx| {
            this.engine.build(ctx, &this.build_request())
        }));
        if self.save_on_disk {
            let this = self.clone();
            actions.push(Action::new(
                format!("save {} to {}", self.tag(), destination.display()),
                move |ctx| this.save(ctx),
            ));
        } else {
            let marker = destination.clone();
            actions.push(Action::new(format!("touch {}", marker.display()), move |_ctx| {
                fsutil::touch(&marker)
            }));
        }

        Ok(vec![Task {
            id: format!("image:{}", self.name),
            title: title("IMG BUILD", self.tag()),
            doc: format!("Build {} container image.", self.name),
            file_dep: self.file_dep(),
            targets: vec![destination],
            actions,
            ..Task::default()
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunRequest;
    use crate::fetch::Fetcher;
    use crate::workspace::Layout;

    struct NoEngine;

    impl ContainerEngine for NoEngine {
        fn build(&self, _: &ExecCtx, _: &BuildRequest) -> Result<()> {
            Ok(())
        }
        fn save(&self, _: &ExecCtx, _: &str, _: &mut dyn Write) -> Result<()> {
            Ok(())
        }
        fn run(&self, _: &ExecCtx, _: &RunRequest) -> Result<()> {
            Ok(())
        }
        fn run_capture(&self, _: &ExecCtx, _: &RunRequest) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct NoFetch;

    impl Fetcher for NoFetch {
        fn fetch(&self, url: &str, _: &Path) -> Result<()> {
            Err(Error::transport(format!("unexpected fetch {url}")))
        }
    }

    fn env() -> BuildEnv {
        BuildEnv::new(
            Layout::new("/repo", "/repo/_build"),
            Arc::new(NoEngine),
            Arc::new(NoFetch),
        )
    }

    #[test]
    fn default_destinations() {
        let img = LocalImage::new(&env(), "build-rpm", "1.0", "/repo/packages/Dockerfile");
        assert_eq!(img.destination(), PathBuf::from("/repo/_build/images/build-rpm-1.0"));

        let saved = img.clone().save_on_disk(true);
        assert_eq!(
            saved.destination(),
            PathBuf::from("/repo/_build/root/images/build-rpm-1.0.tar.gz")
        );
        assert_eq!(
            saved.uncompressed_destination(),
            PathBuf::from("/repo/_build/root/images/build-rpm-1.0.tar")
        );
    }

    #[test]
    fn single_task_with_dockerfile_first() {
        let img = LocalImage::new(&env(), "app", "2", "/repo/app/Dockerfile")
            .with_file_dep([PathBuf::from("/repo/app/app.py")]);
        let tasks = img.tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        let t = &tasks[0];
        assert_eq!(t.id, "image:app");
        assert_eq!(t.title, "IMG BUILD    app:2");
        assert_eq!(
            t.file_dep,
            vec![PathBuf::from("/repo/app/Dockerfile"), PathBuf::from("/repo/app/app.py")]
        );
        let labels: Vec<&str> = t.actions.iter().map(Action::label).collect();
        assert_eq!(labels.len(), 3);
        assert!(labels[2].starts_with("touch "));
    }

    #[test]
    fn bare_dockerfile_builds_from_current_dir() {
        let img = LocalImage::new(&env(), "app", "2", "Dockerfile");
        assert_eq!(img.build_request().context, PathBuf::from("."));
    }

    #[test]
    fn saved_destination_must_be_gzip() {
        let img = LocalImage::new(&env(), "app", "2", "/repo/app/Dockerfile")
            .save_on_disk(true)
            .with_destination("/out/app.tar");
        let err = img.tasks().unwrap_err().to_string();
        assert!(err.contains("must end in .gz"), "{err}");
    }
}
