use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use buildchain::config::{self, EngineConfig, HttpConfig};
use buildchain::engine::CliEngine;
use buildchain::executor::{self, ExecCtx, StateStore, StdoutSink};
use buildchain::fetch::HttpFetcher;
use buildchain::modules::{self, Project};
use buildchain::{Error, Result, workspace};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Load config, compute the plan, and run every task that is out of date
    Run {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Task ids or target prefixes (`image:builder`, `package:calico`); default all
        tasks: Vec<String>,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
        /// Run tasks even when their inputs are unchanged
        #[arg(long)]
        force: bool,
        /// Max number of tasks to execute concurrently (0 = use CPU count)
        #[arg(long, default_value_t = 0)]
        max_parallel: usize,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Check that an image declares every file its Dockerfile copies in
    Verify {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Image name under [images]
        image: String,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let res = match args.cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Run {
            build,
            tasks,
            dry_run,
            force,
            max_parallel,
        } => cmd_run(&build, &tasks, dry_run, force, max_parallel),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Verify { build, image } => cmd_verify(&build, &image),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = res {
        eprintln!("WARN: tracing already initialised: {e}");
    }
}

/// `probe` asks the host for a working engine; planning only needs a name.
fn open_project(path: &Path, probe: bool) -> Result<Project> {
    let doc = config::load(path)?;
    let engine_cfg: EngineConfig = doc.section("engine")?;
    let http: HttpConfig = doc.section("http")?;
    let engine = if probe {
        CliEngine::detect(engine_cfg.program.as_deref())?
    } else {
        CliEngine::new(engine_cfg.program.unwrap_or_else(|| "docker".into()))
    };
    let fetcher = HttpFetcher::new(http.timeout_secs)?;
    Project::open(doc, Arc::new(engine), Arc::new(fetcher))
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let project = open_project(path, false)?;
    let plan = modules::build_plan(&project)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!("{:>2}. {:<36}  {}", i + 1, task.id, task.doc);
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_verify(path: &Path, image: &str) -> Result<()> {
    let project = open_project(path, false)?;
    let report = project.image(image)?.verify_dependencies()?;
    println!("{report}");
    report.into_result()
}

fn cmd_run(path: &Path, tasks: &[String], dry_run: bool, force: bool, max_parallel: usize) -> Result<()> {
    let project = open_project(path, !dry_run)?;
    let layout = project.env.layout.clone();
    workspace::init_dirs(&project.workspace, &layout)?;

    let mut plan = modules::build_plan(&project)?;
    if !tasks.is_empty() {
        plan = plan.select(tasks)?;
    }

    let state = StateStore::open(&layout.state_dir().join("state.json"))?;
    let sink = Arc::new(StdoutSink::with_error_logs(layout.error_logs_dir()));
    let mut ctx = ExecCtx::new(dry_run, sink, Arc::new(state));
    ctx.force = force;

    let max_parallel = if max_parallel == 0 {
        num_cpus::get().max(1)
    } else {
        max_parallel
    };
    tracing::debug!(tasks = plan.len(), max_parallel, "executing plan");
    if max_parallel <= 1 || dry_run {
        executor::execute_plan(&plan, &mut ctx)
    } else {
        executor::execute_plan_parallel(&plan, &ctx, max_parallel)
    }
}
