use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::planner::{Plan, Task};

pub mod uptodate;

pub use uptodate::StateStore;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskSpawned {
        id: String,
    },
    TaskStarted {
        id: String,
        title: String,
    },
    TaskSkipped {
        id: String,
        title: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    error_logs_root: Option<PathBuf>,
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_skipped: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl StdoutSink {
    /// Failed tasks get a log file under `root/<timestamp>/`.
    pub fn with_error_logs(root: PathBuf) -> Self {
        Self {
            error_logs_root: Some(root),
            state: Mutex::default(),
        }
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskSpawned { .. } => {}
            ExecEvent::TaskStarted { id, title } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started = s.tasks_started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!(".  {}", if title.is_empty() { id } else { title });
            }
            ExecEvent::TaskSkipped { id, title } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_skipped = s.tasks_skipped.saturating_add(1);
                }
                println!("-- {}", if title.is_empty() { id } else { title });
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    append_task_log_line(&mut s.task_logs, &id, &line);
                }
                println!("   [{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let err_text = error.unwrap_or_default();
                let mut written = None;
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok = s.tasks_ok.saturating_add(1);
                        s.task_logs.remove(&id);
                    } else {
                        s.tasks_failed = s.tasks_failed.saturating_add(1);
                        s.failed_tasks.push(id.clone());
                        if let Some(root) = self.error_logs_root.clone() {
                            match write_task_error_log(&mut s, &root, &id, &err_text, elapsed_ms)
                            {
                                Ok(path) => written = Some(path),
                                Err(e) => {
                                    println!("WARN: failed to write task error log for {id}: {e}")
                                }
                            }
                        }
                    }
                }
                if !ok {
                    println!("FAIL: {id} ({elapsed_ms}ms)");
                    for line in err_text.lines() {
                        println!("      {line}");
                    }
                }
                if let Some(path) = written {
                    println!("ERROR_LOG: {id} => {}", path.display());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let mut summary = String::new();
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    summary.push_str("SUMMARY:\n");
                    summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                    summary.push_str(&format!(
                        "  tasks: run={} up-to-date={} ok={} failed={}\n",
                        s.tasks_started, s.tasks_skipped, s.tasks_ok, s.tasks_failed
                    ));
                    summary.push_str(&format!("  elapsed: {}\n", format_elapsed_hms(wall.as_secs())));
                    if !s.failed_tasks.is_empty() {
                        let mut failed = s.failed_tasks.clone();
                        failed.sort();
                        failed.dedup();
                        summary.push_str(&format!("  failed_tasks: {}\n", failed.join(", ")));
                    }
                    for p in &s.error_log_paths {
                        summary.push_str(&format!("  error_log: {}\n", p.display()));
                    }
                    *s = StdoutSinkState::default();
                }
                print!("{summary}");
                if let Some(e) = error.filter(|_| !ok) {
                    println!("  error: {e}");
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    /// Ignore recorded signatures and run every selected task.
    pub force: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    state: Arc<StateStore>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>, state: Arc<StateStore>) -> Self {
        Self {
            dry_run,
            force: false,
            sink,
            current_task_id: None,
            state,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Run a command, forwarding its sanitised output lines to the sink.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        tracing::debug!(command = ?cmd, "spawning");
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::engine(format!("failed to spawn {:?}: {e}", cmd.get_program())))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut tail: VecDeque<String> = VecDeque::new();
        for line in rx {
            let line = sanitize_log_line(&line);
            if line.is_empty() {
                continue;
            }
            self.log(&line);
            if tail.len() == ERROR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::engine(format!("wait failed: {e}")))?;
        if !status.success() {
            let mut msg = format!("command failed: {status}");
            for line in tail {
                msg.push_str("\n  ");
                msg.push_str(&line);
            }
            return Err(Error::engine(msg));
        }
        Ok(())
    }

    /// Run a command and return its stdout; stderr lines go to the sink.
    pub fn run_cmd_capture(&self, mut cmd: Command) -> Result<Vec<u8>> {
        tracing::debug!(command = ?cmd, "spawning (capture)");
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::engine(format!("failed to spawn {:?}: {e}", cmd.get_program())))?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        for line in stderr.lines() {
            let line = sanitize_log_line(line);
            if !line.is_empty() {
                self.log(&line);
            }
        }
        if !out.status.success() {
            let detail = stderr.trim();
            return Err(Error::engine(if detail.is_empty() {
                format!("command failed: {}", out.status)
            } else {
                format!("command failed: {}: {detail}", out.status)
            }));
        }
        Ok(out.stdout)
    }
}

const ERROR_TAIL_LINES: usize = 20;

enum TaskOutcome {
    Ran,
    Skipped,
}

fn run_task(task: &Task, ctx: &mut ExecCtx) -> Result<TaskOutcome> {
    ctx.set_task(task.id.clone());
    if !ctx.force && ctx.state().is_up_to_date(task)? {
        ctx.sink.emit(ExecEvent::TaskSkipped {
            id: task.id.clone(),
            title: task.title.clone(),
        });
        return Ok(TaskOutcome::Skipped);
    }

    ctx.sink.emit(ExecEvent::TaskStarted {
        id: task.id.clone(),
        title: task.title.clone(),
    });
    if ctx.dry_run {
        for action in &task.actions {
            ctx.log(&format!("DRY-RUN: {}", action.label()));
        }
        return Ok(TaskOutcome::Ran);
    }

    if let Err(e) = run_actions(task, ctx) {
        // A failed run leaves its targets in an unknown state.
        ctx.state().forget(&task.id)?;
        return Err(e);
    }
    ctx.state().record(task)?;
    Ok(TaskOutcome::Ran)
}

fn run_actions(task: &Task, ctx: &mut ExecCtx) -> Result<()> {
    for action in &task.actions {
        tracing::debug!(task = %task.id, action = action.label(), "action");
        action.call(ctx)?;
    }
    if let Some(missing) = task.targets.iter().find(|t| !t.exists()) {
        return Err(Error::plan(format!(
            "task '{}' finished without producing target {}",
            task.id,
            missing.display()
        )));
    }
    Ok(())
}

fn finish(ctx: &ExecCtx, id: &str, res: &Result<TaskOutcome>, elapsed_ms: u128) {
    match res {
        Ok(TaskOutcome::Skipped) => {}
        Ok(TaskOutcome::Ran) => ctx.sink.emit(ExecEvent::TaskFinished {
            id: id.to_string(),
            ok: true,
            error: None,
            elapsed_ms,
        }),
        Err(e) => ctx.sink.emit(ExecEvent::TaskFinished {
            id: id.to_string(),
            ok: false,
            error: Some(e.to_string()),
            elapsed_ms,
        }),
    }
}

pub fn execute_plan(plan: &Plan, ctx: &mut ExecCtx) -> Result<()> {
    for task in plan.ordered()? {
        ctx.sink.emit(ExecEvent::TaskSpawned {
            id: task.id.clone(),
        });
        let start = Instant::now();
        let res = run_task(task, ctx);
        finish(ctx, &task.id, &res, start.elapsed().as_millis());
        if let Err(e) = res {
            let e = e.context(format!("task '{}' failed", task.id));
            ctx.sink.emit(ExecEvent::ExecutorDone {
                ok: false,
                error: Some(e.to_string()),
            });
            return Err(e);
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

/// Run independent tasks on up to `max_parallel` threads.
///
/// After the first failure no new task is started; running ones finish.
pub fn execute_plan_parallel(plan: &Plan, ctx_template: &ExecCtx, max_parallel: usize) -> Result<()> {
    if max_parallel <= 1 || ctx_template.dry_run {
        let mut ctx = ctx_template.clone();
        return execute_plan(plan, &mut ctx);
    }
    // Surface cycles and bad task_dep before spawning anything.
    plan.ordered()?;

    let mut incoming: BTreeMap<String, usize> = BTreeMap::new();
    let mut outgoing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for task in plan.tasks() {
        let deps = plan.dependencies(&task.id)?;
        incoming.insert(task.id.clone(), deps.len());
        outgoing.entry(task.id.clone()).or_default();
        for dep in deps {
            outgoing
                .entry(dep.to_string())
                .or_default()
                .insert(task.id.clone());
        }
    }

    let total = incoming.len();
    let mut completed: BTreeSet<String> = BTreeSet::new();
    let mut ready: VecDeque<String> = incoming
        .iter()
        .filter_map(|(k, v)| (*v == 0).then_some(k.clone()))
        .collect();

    let (tx, rx) = mpsc::channel::<(String, Result<TaskOutcome>, u128)>();
    let mut running: HashMap<String, std::thread::JoinHandle<()>> = HashMap::new();
    let mut first_err: Option<Error> = None;

    while completed.len() < total {
        while first_err.is_none() && running.len() < max_parallel {
            let Some(task_id) = ready.pop_front() else {
                break;
            };
            let Some(task) = plan.get(&task_id).cloned() else {
                continue;
            };
            let tx = tx.clone();
            let ctx = ctx_template.clone();
            ctx.sink.emit(ExecEvent::TaskSpawned {
                id: task_id.clone(),
            });
            let handle = std::thread::spawn(move || {
                let mut local_ctx = ctx;
                let start = Instant::now();
                let r = run_task(&task, &mut local_ctx);
                let _ = tx.send((task.id.clone(), r, start.elapsed().as_millis()));
            });
            running.insert(task_id, handle);
        }

        if running.is_empty() {
            if first_err.is_none() && ready.is_empty() {
                let remaining: Vec<String> = incoming
                    .iter()
                    .filter_map(|(k, v)| (*v > 0).then_some(k.clone()))
                    .collect();
                first_err = Some(Error::plan(format!(
                    "cannot make progress; remaining: {}",
                    remaining.join(", ")
                )));
            }
            break;
        }

        let (done_id, res, elapsed_ms) = rx
            .recv()
            .map_err(|e| Error::plan(format!("executor recv failed: {e}")))?;
        if let Some(h) = running.remove(&done_id)
            && h.join().is_err()
            && first_err.is_none()
        {
            first_err = Some(Error::plan(format!("task '{done_id}' panicked")));
        }

        finish(ctx_template, &done_id, &res, elapsed_ms);
        match res {
            Ok(_) => {
                completed.insert(done_id.clone());
                if let Some(children) = outgoing.get(&done_id) {
                    for child in children {
                        if let Some(slot) = incoming.get_mut(child) {
                            *slot -= 1;
                            if *slot == 0 {
                                ready.push_back(child.clone());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e.context(format!("task '{done_id}' failed")));
                }
            }
        }
    }

    for (_, h) in running.drain() {
        let _ = h.join();
    }

    if let Some(e) = first_err {
        ctx_template.sink.emit(ExecEvent::ExecutorDone {
            ok: false,
            error: Some(e.to_string()),
        });
        return Err(e);
    }
    ctx_template.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    let r = BufReader::new(reader);
    for chunk in r.split(b'\n') {
        let Ok(bytes) = chunk else {
            break;
        };
        // Progress bars rewrite the line with '\r'; keep each frame separate.
        for part in bytes.split(|b| *b == b'\r') {
            if part.is_empty() {
                continue;
            }
            let _ = tx.send(String::from_utf8_lossy(part).into_owned());
        }
    }
}

fn append_task_log_line(task_logs: &mut BTreeMap<String, VecDeque<String>>, task_id: &str, line: &str) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_log_line(line));
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    root: &std::path::Path,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match state.error_logs_dir.clone() {
        Some(dir) => dir,
        None => {
            let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::io(format!("failed to create error logs dir {}: {e}", dir.display()))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = String::new();
    body.push_str(&format!("task: {task_id}\n"));
    body.push_str("status: failed\n");
    body.push_str(&format!("elapsed_ms: {elapsed_ms}\n"));
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    if let Some(lines) = state.task_logs.get(task_id) {
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
    }

    fs::write(&path, body)
        .map_err(|e| Error::io(format!("failed to write task error log {}: {e}", path.display())))?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
