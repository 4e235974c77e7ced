#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use buildchain::engine::{BuildRequest, ContainerEngine, RunRequest};
use buildchain::executor::{ExecCtx, ExecEvent, ExecSink, StateStore};
use buildchain::fetch::Fetcher;
use buildchain::targets::BuildEnv;
use buildchain::workspace::Layout;
use buildchain::{Error, Result};

#[derive(Debug, Clone)]
pub enum Call {
    Build(BuildRequest),
    Save(String),
    Run(RunRequest),
    RunCapture(RunRequest),
}

/// Engine double: records every call, writes the SRPM `buildsrpm` would produce.
#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<Call>>,
    meta: Mutex<Vec<u8>>,
    fail_build: bool,
    fail_save: bool,
}

impl RecordingEngine {
    pub fn with_meta(meta: &str) -> Self {
        Self {
            meta: Mutex::new(meta.as_bytes().to_vec()),
            ..Self::default()
        }
    }

    pub fn failing_build() -> Self {
        Self {
            fail_build: true,
            ..Self::default()
        }
    }

    pub fn failing_save() -> Self {
        Self {
            fail_save: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ContainerEngine for RecordingEngine {
    fn build(&self, _ctx: &ExecCtx, req: &BuildRequest) -> Result<()> {
        self.record(Call::Build(req.clone()));
        if self.fail_build {
            return Err(Error::engine(format!("build of {} exited with status 1", req.tag)));
        }
        Ok(())
    }

    fn save(&self, _ctx: &ExecCtx, tag: &str, out: &mut dyn Write) -> Result<()> {
        self.record(Call::Save(tag.to_string()));
        out.write_all(b"fake image archive")?;
        if self.fail_save {
            return Err(Error::engine(format!("save of {tag} exited with status 125")));
        }
        Ok(())
    }

    fn run(&self, _ctx: &ExecCtx, req: &RunRequest) -> Result<()> {
        self.record(Call::Run(req.clone()));
        let out_dir = req
            .mounts
            .iter()
            .find(|m| m.target == "/rpmbuild/SRPMS")
            .map(|m| m.source.clone());
        if let (Some(dir), Some(name)) = (out_dir, req.env.get("SRPM")) {
            fs::write(dir.join(name), b"srpm")?;
        }
        Ok(())
    }

    fn run_capture(&self, _ctx: &ExecCtx, req: &RunRequest) -> Result<Vec<u8>> {
        self.record(Call::RunCapture(req.clone()));
        Ok(self.meta.lock().unwrap().clone())
    }
}

/// Fetcher double serving canned bodies by URL.
#[derive(Default)]
pub struct FakeFetcher {
    bodies: BTreeMap<String, Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn serving(bodies: &[(&str, &str)]) -> Self {
        Self {
            bodies: bodies
                .iter()
                .map(|(url, body)| (url.to_string(), body.as_bytes().to_vec()))
                .collect(),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        self.fetched.lock().unwrap().push(url.to_string());
        let body = self
            .bodies
            .get(url)
            .ok_or_else(|| Error::transport(format!("GET {url} failed with status 404 Not Found")))?;
        fs::write(dest, body)?;
        Ok(())
    }
}

pub struct NullSink;

impl ExecSink for NullSink {
    fn emit(&self, _ev: ExecEvent) {}
}

pub fn ctx(state: Arc<StateStore>) -> ExecCtx {
    ExecCtx::new(false, Arc::new(NullSink), state)
}

pub fn write(root: &Path, rel: &str, body: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, body).unwrap();
    path
}

pub fn env(root: &Path, engine: Arc<RecordingEngine>, fetcher: Arc<FakeFetcher>) -> BuildEnv {
    BuildEnv::new(Layout::new(root, root.join("_build")), engine, fetcher)
}
