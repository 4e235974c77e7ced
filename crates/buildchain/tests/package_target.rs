mod support;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use buildchain::ErrorKind;
use buildchain::executor::{StateStore, execute_plan, execute_plan_parallel};
use buildchain::planner::Plan;
use buildchain::targets::{BuildTarget, LocalImage, Package};
use support::{Call, FakeFetcher, RecordingEngine, ctx, env, write};

const META: &str = "Name: pkg\n\
Version: 1.0\n\
Source0: https://example.org/pkg-1.0.tar.gz\n\
Source1: https://example.org/patch.diff\n\
BuildArch: x86_64\n";

fn fetcher() -> Arc<FakeFetcher> {
    Arc::new(FakeFetcher::serving(&[
        ("https://example.org/pkg-1.0.tar.gz", "tarball"),
        ("https://example.org/patch.diff", "--- a\n+++ b\n"),
    ]))
}

fn repo(root: &Path) {
    write(root, "packages/Dockerfile", "FROM centos:7\n");
    write(root, "packages/entrypoint.sh", "#!/bin/sh\n");
    write(root, "packages/rpmlintrc", "");
    write(root, "packages/pkg.spec", "Name: pkg\nSource0: https://example.org/pkg-1.0.tar.gz\n");
}

fn pipeline(root: &Path, engine: Arc<RecordingEngine>, fetcher: Arc<FakeFetcher>) -> (Plan, Package) {
    let env = env(root, engine, fetcher);
    let builder = LocalImage::new(&env, "build-rpm", "1.0", root.join("packages/Dockerfile"));
    let pkg = Package::new(
        &env,
        "pkg",
        "1.0",
        1,
        vec!["pkg-1.0.tar.gz".into(), "patch.diff".into()],
        &builder,
    );
    let mut plan = Plan::default();
    plan.extend(builder.tasks().unwrap()).unwrap();
    plan.extend(pkg.tasks().unwrap()).unwrap();
    (plan, pkg)
}

fn container_runs(engine: &RecordingEngine) -> usize {
    engine
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Run(_) | Call::RunCapture(_)))
        .count()
}

#[test]
fn sources_download_under_their_exact_names() {
    let tmp = tempfile::tempdir().expect("tempdir");
    repo(tmp.path());
    let engine = Arc::new(RecordingEngine::with_meta(META));
    let fetcher = fetcher();
    let (plan, pkg) = pipeline(tmp.path(), engine.clone(), fetcher.clone());

    execute_plan(&plan, &mut ctx(Arc::new(StateStore::in_memory()))).unwrap();

    let srcdir = tmp.path().join("_build/packages/pkg/SOURCES");
    assert_eq!(fs::read_to_string(srcdir.join("pkg-1.0.tar.gz")).unwrap(), "tarball");
    assert_eq!(fs::read_to_string(srcdir.join("patch.diff")).unwrap(), "--- a\n+++ b\n");
    assert_eq!(fetcher.fetched().len(), 2);
    assert_eq!(fs::read_to_string(pkg.meta()).unwrap(), META);
    assert_eq!(pkg.srpm(), tmp.path().join("_build/packages/pkg-1.0-1.el7.src.rpm"));
    assert!(pkg.srpm().is_file());

    let calls = engine.calls();
    assert!(matches!(calls[0], Call::Build(_)));
    let Call::Run(srpm_run) = calls.last().unwrap() else {
        panic!("last call should be buildsrpm: {calls:?}");
    };
    assert_eq!(srpm_run.env["SOURCES"], "pkg-1.0.tar.gz patch.diff");
    assert!(srpm_run.read_only);
}

#[test]
fn unchanged_inputs_skip_every_container_run() {
    let tmp = tempfile::tempdir().expect("tempdir");
    repo(tmp.path());
    let engine = Arc::new(RecordingEngine::with_meta(META));
    let (plan, pkg) = pipeline(tmp.path(), engine.clone(), fetcher());
    let state = Arc::new(StateStore::open(&tmp.path().join("_build/.buildchain/state.json")).unwrap());

    execute_plan(&plan, &mut ctx(state.clone())).unwrap();
    let first = engine.calls().len();
    assert_eq!(container_runs(&engine), 2);

    execute_plan(&plan, &mut ctx(state.clone())).unwrap();
    assert_eq!(engine.calls().len(), first);

    // A spec edit reruns rpmspec and the SRPM build, but not the downloads.
    fs::write(pkg.spec(), "Name: pkg\nSource0: https://example.org/pkg-1.0.tar.gz\n# edited\n").unwrap();
    execute_plan(&plan, &mut ctx(state)).unwrap();
    assert_eq!(container_runs(&engine), 4);
    assert!(engine.builds().len() == 1);
}

#[test]
fn metadata_missing_a_source_names_it() {
    let tmp = tempfile::tempdir().expect("tempdir");
    repo(tmp.path());
    let engine = Arc::new(RecordingEngine::with_meta(
        "Source0: https://example.org/pkg-1.0.tar.gz\n",
    ));
    let fetcher = fetcher();
    let (plan, pkg) = pipeline(tmp.path(), engine.clone(), fetcher.clone());

    let err = execute_plan(&plan, &mut ctx(Arc::new(StateStore::in_memory()))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MetadataIncomplete);
    assert!(
        err.to_string().contains("URL not found for source files: patch.diff"),
        "unexpected err: {err}"
    );
    assert!(fetcher.fetched().is_empty());
    assert!(!pkg.srpm().exists());
}

#[test]
fn failed_download_aborts_the_stage() {
    let tmp = tempfile::tempdir().expect("tempdir");
    repo(tmp.path());
    let engine = Arc::new(RecordingEngine::with_meta(META));
    let fetcher = Arc::new(FakeFetcher::serving(&[("https://example.org/patch.diff", "")]));
    let (plan, _pkg) = pipeline(tmp.path(), engine.clone(), fetcher.clone());

    let err = execute_plan(&plan, &mut ctx(Arc::new(StateStore::in_memory()))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.to_string().contains("failed to download"), "unexpected err: {err}");
    assert_eq!(container_runs(&engine), 1);
}

#[test]
fn independent_packages_build_in_parallel() {
    let tmp = tempfile::tempdir().expect("tempdir");
    repo(tmp.path());
    write(tmp.path(), "packages/other.spec", "Name: other\n");
    let engine = Arc::new(RecordingEngine::with_meta(META));
    let (mut plan, _pkg) = pipeline(tmp.path(), engine.clone(), fetcher());

    let env = env(tmp.path(), engine.clone(), fetcher());
    let builder = LocalImage::new(&env, "build-rpm", "1.0", tmp.path().join("packages/Dockerfile"));
    let other = Package::new(&env, "other", "2.0", 3, vec!["patch.diff".into()], &builder);
    plan.extend(other.tasks().unwrap()).unwrap();

    execute_plan_parallel(&plan, &ctx(Arc::new(StateStore::in_memory())), 4).unwrap();
    assert!(other.srpm().is_file());
    assert!(tmp.path().join("_build/packages/pkg-1.0-1.el7.src.rpm").is_file());
    assert_eq!(engine.builds().len(), 1);
}

#[test]
fn mount_set_tracks_declared_sources() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let env = env(
        tmp.path(),
        Arc::new(RecordingEngine::default()),
        Arc::new(FakeFetcher::default()),
    );
    let builder = LocalImage::new(&env, "build-rpm", "1.0", tmp.path().join("Dockerfile"));
    for n in 0..4 {
        let sources: Vec<String> = (0..n).map(|i| format!("src{i}.tar.gz")).collect();
        let pkg = Package::new(&env, "pkg", "1.0", 1, sources, &builder);
        let mounts = pkg.buildsrpm_mounts().into_mounts();
        assert_eq!(mounts.len(), n + 3);
        let writable: Vec<&str> = mounts
            .iter()
            .filter(|m| !m.read_only)
            .map(|m| m.target.as_str())
            .collect();
        assert_eq!(writable, vec!["/rpmbuild/SRPMS"]);
    }
}
