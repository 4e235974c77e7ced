//! RPM source packages built inside a builder image.
//!
//! Each package expands into four tasks run in order: create the package
//! directory, render the spec into a `.meta` file, download the sources the
//! `.meta` points at, then build the SRPM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{BuildEnv, BuildTarget, LocalImage, title, title_with_target};
use crate::engine::{ContainerEngine, Mount, RunRequest};
use crate::error::Result;
use crate::fetch::{self, Fetcher};
use crate::fsutil;
use crate::planner::{Action, Task, UptodateCheck};
use crate::rpm::SourcePlan;

const SUFFIX: &str = "el7";
const SPECS_DIR: &str = "/rpmbuild/SPECS";
const SOURCES_DIR: &str = "/rpmbuild/SOURCES";
const SRPMS_DIR: &str = "/rpmbuild/SRPMS";

/// Bind mounts handed to `buildsrpm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderMountSet {
    spec: Mount,
    srpm_dir: Mount,
    rpmlintrc: Mount,
    sources: Vec<Mount>,
}

impl BuilderMountSet {
    pub fn spec(&self) -> &Mount {
        &self.spec
    }

    pub fn srpm_dir(&self) -> &Mount {
        &self.srpm_dir
    }

    pub fn rpmlintrc(&self) -> &Mount {
        &self.rpmlintrc
    }

    pub fn sources(&self) -> &[Mount] {
        &self.sources
    }

    pub fn into_mounts(self) -> Vec<Mount> {
        let mut out = vec![self.spec, self.srpm_dir, self.rpmlintrc];
        out.extend(self.sources);
        out
    }
}

#[derive(Clone)]
pub struct Package {
    name: String,
    version: String,
    build_id: u32,
    sources: Vec<String>,
    spec: PathBuf,
    build_root: PathBuf,
    pkg_root: PathBuf,
    rpmlintrc: PathBuf,
    entrypoint: PathBuf,
    builder_tag: String,
    builder_destination: PathBuf,
    engine: Arc<dyn ContainerEngine>,
    fetcher: Arc<dyn Fetcher>,
}

impl Package {
    pub fn new(
        env: &BuildEnv,
        name: impl Into<String>,
        version: impl Into<String>,
        build_id: u32,
        sources: Vec<String>,
        builder: &LocalImage,
    ) -> Self {
        let name = name.into();
        Self {
            spec: env.layout.spec_file(&name),
            name,
            version: version.into(),
            build_id,
            sources,
            build_root: env.layout.build_root.clone(),
            pkg_root: env.layout.pkg_root(),
            rpmlintrc: env.layout.rpmlintrc(),
            entrypoint: env.layout.entrypoint(),
            builder_tag: builder.tag(),
            builder_destination: builder.destination(),
            engine: env.engine.clone(),
            fetcher: env.fetcher.clone(),
        }
    }

    pub fn with_spec(mut self, spec: impl Into<PathBuf>) -> Self {
        self.spec = spec.into();
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn build_id(&self) -> u32 {
        self.build_id
    }

    pub fn rootdir(&self) -> PathBuf {
        self.pkg_root.join(&self.name)
    }

    pub fn srcdir(&self) -> PathBuf {
        self.rootdir().join("SOURCES")
    }

    pub fn spec(&self) -> &Path {
        &self.spec
    }

    pub fn meta(&self) -> PathBuf {
        self.rootdir().join(format!("{}.meta", self.name))
    }

    pub fn srpm(&self) -> PathBuf {
        self.pkg_root.join(format!(
            "{}-{}-{}.{SUFFIX}.src.rpm",
            self.name, self.version, self.build_id
        ))
    }

    /// Local paths of the source files, under `SOURCES`.
    pub fn sources(&self) -> Vec<PathBuf> {
        let dir = self.srcdir();
        self.sources.iter().map(|s| dir.join(s)).collect()
    }

    fn spec_filename(&self) -> String {
        file_name(&self.spec)
    }

    fn task_id(&self, stage: &str) -> String {
        format!("package:{}:{stage}", self.name)
    }

    pub fn buildsrpm_mounts(&self) -> BuilderMountSet {
        let srpm = self.srpm();
        let srpm_dir = srpm.parent().unwrap_or(self.pkg_root.as_path()).to_path_buf();
        BuilderMountSet {
            spec: Mount::bind_ro(&self.spec, format!("{SPECS_DIR}/{}", self.spec_filename())),
            srpm_dir: Mount::bind(srpm_dir, SRPMS_DIR),
            rpmlintrc: Mount::bind_ro(&self.rpmlintrc, "/rpmbuild/rpmlintrc"),
            sources: self
                .sources()
                .into_iter()
                .map(|src| {
                    let target = format!("{SOURCES_DIR}/{}", file_name(&src));
                    Mount::bind_ro(src, target)
                })
                .collect(),
        }
    }

    pub fn buildsrpm_request(&self) -> RunRequest {
        let env = [
            ("SPEC".to_string(), self.spec_filename()),
            ("SRPM".to_string(), file_name(&self.srpm())),
            ("SOURCES".to_string(), self.sources.join(" ")),
        ];
        let tmpfs = [
            ("/home/build".to_string(), String::new()),
            ("/var/tmp".to_string(), String::new()),
        ];
        RunRequest::builder(self.builder_tag.clone(), &self.entrypoint)
            .expand(self.buildsrpm_mounts().into_mounts(), env, tmpfs)
            .command(["/entrypoint.sh", "buildsrpm"])
            .read_only()
    }

    pub fn rpmspec_request(&self) -> RunRequest {
        let container_spec = format!("{SPECS_DIR}/{}", self.spec_filename());
        RunRequest {
            image: self.builder_tag.clone(),
            command: vec![
                "su".into(),
                "-l".into(),
                "build".into(),
                "-c".into(),
                format!("rpmspec -P {}", fsutil::sh_quote(&container_spec)),
            ],
            mounts: vec![Mount::bind_ro(&self.spec, container_spec)],
            read_only: true,
            hostname: Some("build".into()),
            remove: true,
            ..RunRequest::default()
        }
    }

    fn mkdir_task(&self) -> Task {
        let dir = self.rootdir();
        let target = dir.clone();
        Task {
            id: self.task_id("mkdir"),
            title: title("MKDIR", dir.display()),
            doc: format!("Create directory for {}.", self.name),
            targets: vec![dir.clone()],
            uptodate: vec![UptodateCheck::path_exists(dir.clone())],
            actions: vec![Action::new(format!("mkdir -p {}", dir.display()), move |_ctx| {
                fsutil::ensure_dir(&target)
            })],
            ..Task::default()
        }
    }

    fn rpmspec_task(&self) -> Task {
        let meta = self.meta();
        let this = self.clone();
        Task {
            id: self.task_id("rpmspec"),
            title: title_with_target("RPMSPEC", &self.build_root, &meta),
            doc: format!("Generate {}.meta", self.name),
            file_dep: vec![self.spec.clone(), self.builder_destination.clone()],
            task_dep: vec![self.task_id("mkdir")],
            targets: vec![meta.clone()],
            actions: vec![Action::new(format!("rpmspec -P {}", self.spec.display()), move |ctx| {
                let out = this.engine.run_capture(ctx, &this.rpmspec_request())?;
                fsutil::write_bytes(&meta, &out)?;
                tracing::info!(path = %meta.display(), "metadata written");
                Ok(())
            })],
            ..Task::default()
        }
    }

    fn get_source_task(&self) -> Task {
        let srcdir = self.srcdir();
        let mut targets = vec![srcdir.clone()];
        targets.extend(self.sources());
        let this = self.clone();
        Task {
            id: self.task_id("get_source"),
            title: title_with_target("GET_SRC", &self.build_root, &srcdir),
            doc: format!("Download source files for {}.", self.name),
            file_dep: vec![self.meta()],
            task_dep: vec![self.task_id("mkdir")],
            targets,
            actions: vec![Action::new(format!("download sources into {}", srcdir.display()), move |ctx| {
                fsutil::ensure_dir(&srcdir)?;
                let plan = SourcePlan::from_meta_file(&this.meta(), &this.sources)?;
                ctx.log(&format!("{} source(s) to download", plan.len()));
                fetch::fetch_all(this.fetcher.as_ref(), &plan, &srcdir)
            })],
            ..Task::default()
        }
    }

    fn srpm_task(&self) -> Task {
        let srpm = self.srpm();
        let mut file_dep = vec![self.spec.clone(), self.builder_destination.clone()];
        file_dep.extend(self.sources());
        let this = self.clone();
        Task {
            id: self.task_id("srpm"),
            title: title_with_target("BUILD SRPM", &self.build_root, &srpm),
            doc: format!("Build {}", file_name(&srpm)),
            file_dep,
            task_dep: vec![self.task_id("mkdir")],
            targets: vec![srpm],
            actions: vec![Action::new("/entrypoint.sh buildsrpm", move |ctx| {
                this.engine.run(ctx, &this.buildsrpm_request())
            })],
            ..Task::default()
        }
    }
}

impl BuildTarget for Package {
    fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self) -> Result<Vec<Task>> {
        Ok(vec![
            self.mkdir_task(),
            self.rpmspec_task(),
            self.get_source_task(),
            self.srpm_task(),
        ])
    }
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
