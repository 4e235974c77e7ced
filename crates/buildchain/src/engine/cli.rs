use std::ffi::OsString;
use std::io::{Read, Write};
use std::process::{Command, Stdio};

use super::{BuildRequest, ContainerEngine, RunRequest};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub const ENGINE_ENV: &str = "BUILDCHAIN_CONTAINER_ENGINE";

/// Drives `docker` or `podman` through their command line.
#[derive(Debug, Clone)]
pub struct CliEngine {
    program: String,
}

impl CliEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Configured program first, then `$BUILDCHAIN_CONTAINER_ENGINE`, then
    /// whichever of docker/podman answers `--version`.
    pub fn detect(configured: Option<&str>) -> Result<Self> {
        if let Some(program) = configured.map(str::trim).filter(|p| !p.is_empty()) {
            return Ok(Self::new(program));
        }
        pick_container_engine().map(Self::new)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, args: Vec<OsString>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd
    }
}

impl ContainerEngine for CliEngine {
    fn build(&self, ctx: &ExecCtx, req: &BuildRequest) -> Result<()> {
        ctx.log(&format!("{} build -t {}", self.program, req.tag));
        ctx.run_cmd(self.command(build_args(req)))
            .map_err(|e| e.context(format!("failed to build image {}", req.tag)))
    }

    fn save(&self, ctx: &ExecCtx, tag: &str, out: &mut dyn Write) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("save").arg(tag);
        tracing::debug!(command = ?cmd, "spawning (save)");
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::engine(format!("failed to spawn {}: {e}", self.program)))?;

        let stderr = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });
        let copied = match child.stdout.take() {
            Some(mut stdout) => std::io::copy(&mut stdout, out)
                .map_err(|e| Error::io(format!("failed to write image {tag}: {e}"))),
            None => Err(Error::engine("engine stdout not captured")),
        };
        let status = child
            .wait()
            .map_err(|e| Error::engine(format!("wait failed: {e}")))?;
        let stderr = stderr
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        for line in stderr.lines() {
            ctx.log(&crate::log_sanitize::sanitize_log_line(line));
        }
        if !status.success() {
            return Err(Error::engine(format!(
                "failed to save image {tag}: {status}: {}",
                stderr.trim()
            )));
        }
        let bytes = copied?;
        tracing::debug!(tag, bytes, "image saved");
        Ok(())
    }

    fn run(&self, ctx: &ExecCtx, req: &RunRequest) -> Result<()> {
        ctx.run_cmd(self.command(run_args(req)))
            .map_err(|e| e.context(format!("container {} failed", req.image)))
    }

    fn run_capture(&self, ctx: &ExecCtx, req: &RunRequest) -> Result<Vec<u8>> {
        ctx.run_cmd_capture(self.command(run_args(req)))
            .map_err(|e| e.context(format!("container {} failed", req.image)))
    }
}

pub fn build_args(req: &BuildRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["build".into(), "--tag".into(), req.tag.clone().into()];
    args.push("--file".into());
    args.push(req.dockerfile.clone().into());
    for (k, v) in &req.build_args {
        args.push("--build-arg".into());
        args.push(format!("{k}={v}").into());
    }
    args.push(req.context.clone().into());
    args
}

pub fn run_args(req: &RunRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["run".into()];
    if req.remove {
        args.push("--rm".into());
    }
    if let Some(host) = &req.hostname {
        args.push("--hostname".into());
        args.push(host.into());
    }
    for (k, v) in &req.env {
        args.push("--env".into());
        args.push(format!("{k}={v}").into());
    }
    for m in &req.mounts {
        let mut spec = OsString::from("type=bind,source=");
        spec.push(&m.source);
        spec.push(format!(",target={}", m.target));
        if m.read_only {
            spec.push(",readonly");
        }
        args.push("--mount".into());
        args.push(spec);
    }
    for (path, opts) in &req.tmpfs {
        args.push("--tmpfs".into());
        args.push(if opts.is_empty() {
            path.into()
        } else {
            format!("{path}:{opts}").into()
        });
    }
    if req.read_only {
        args.push("--read-only".into());
    }
    args.push(req.image.clone().into());
    args.extend(req.command.iter().map(OsString::from));
    args
}

fn pick_container_engine() -> Result<String> {
    if let Ok(pref) = std::env::var(ENGINE_ENV) {
        let pref = pref.trim();
        if pref.is_empty() {
            return Err(Error::msg(format!("{ENGINE_ENV} is set but empty")));
        }
        if command_works(pref, &["--version"]) {
            return Ok(pref.to_string());
        }
        return Err(Error::engine(format!(
            "container engine '{pref}' from {ENGINE_ENV} is not available"
        )));
    }

    for candidate in ["docker", "podman"] {
        if command_works(candidate, &["--version"]) {
            return Ok(candidate.to_string());
        }
    }
    Err(Error::engine(format!(
        "no container engine found (tried docker, podman); set {ENGINE_ENV}"
    )))
}

fn command_works(bin: &str, args: &[&str]) -> bool {
    Command::new(bin)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
