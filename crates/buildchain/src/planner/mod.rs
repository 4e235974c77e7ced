use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::fsutil::normalize;

pub type TaskId = String;

type ActionFn = dyn Fn(&mut ExecCtx) -> Result<()> + Send + Sync;
type CheckFn = dyn Fn() -> bool + Send + Sync;

/// One step of a task body. Steps run in order; the first error stops the task.
#[derive(Clone)]
pub struct Action {
    label: String,
    run: Arc<ActionFn>,
}

impl Action {
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ExecCtx) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            run: Arc::new(f),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn call(&self, ctx: &mut ExecCtx) -> Result<()> {
        (self.run)(ctx)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Action").field(&self.label).finish()
    }
}

/// Extra up-to-date condition evaluated before a task runs.
#[derive(Clone)]
pub struct UptodateCheck {
    label: String,
    check: Arc<CheckFn>,
}

impl UptodateCheck {
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            check: Arc::new(f),
        }
    }

    pub fn path_exists(path: PathBuf) -> Self {
        Self::new(format!("exists {}", path.display()), move || path.exists())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn holds(&self) -> bool {
        (self.check)()
    }
}

impl fmt::Debug for UptodateCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UptodateCheck").field(&self.label).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Task {
    pub id: TaskId,
    /// Short aligned line shown when the task runs.
    pub title: String,
    pub doc: String,
    pub file_dep: Vec<PathBuf>,
    pub task_dep: Vec<TaskId>,
    pub targets: Vec<PathBuf>,
    pub uptodate: Vec<UptodateCheck>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Default, Clone)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
    producers: BTreeMap<PathBuf, TaskId>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::plan(format!("duplicate task id '{}'", task.id)));
        }
        for target in &task.targets {
            let key = normalize(target);
            if let Some(existing) = self.producers.get(&key) {
                return Err(Error::plan(format!(
                    "target '{}' is produced by both '{}' and '{}'",
                    target.display(),
                    existing,
                    task.id
                )));
            }
        }
        for target in &task.targets {
            self.producers.insert(normalize(target), task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = Task>) -> Result<()> {
        for task in tasks {
            self.add(task)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task that lists `path` among its targets.
    pub fn producer_of(&self, path: &Path) -> Option<&str> {
        self.producers.get(&normalize(path)).map(String::as_str)
    }

    /// Explicit `task_dep` plus the producers of every `file_dep`.
    pub fn dependencies(&self, id: &str) -> Result<BTreeSet<&str>> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| Error::plan(format!("unknown task '{id}'")))?;
        let mut out = BTreeSet::new();
        for dep in &task.task_dep {
            let Some((dep_id, _)) = self.tasks.get_key_value(dep.as_str()) else {
                return Err(Error::plan(format!(
                    "task '{}' has invalid dependency '{}'",
                    id, dep
                )));
            };
            out.insert(dep_id.as_str());
        }
        for file in &task.file_dep {
            if let Some(producer) = self.producer_of(file)
                && producer != id
            {
                out.insert(producer);
            }
        }
        Ok(out)
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for id in self.tasks.keys() {
            let deps = self.dependencies(id)?;
            incoming.insert(id.as_str(), deps.len());
            outgoing.entry(id.as_str()).or_default();
            for dep in deps {
                outgoing.entry(dep).or_default().insert(id.as_str());
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    if let Some(slot) = incoming.get_mut(m) {
                        *slot -= 1;
                        if *slot == 0 {
                            q.push_back(m);
                        }
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::plan(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    /// Sub-plan holding the selected tasks and everything they depend on.
    ///
    /// A selector is a task id, or a prefix ending before `:` that picks every
    /// sub-task of a target (`package:calico` selects `package:calico:srpm`).
    pub fn select<S: AsRef<str>>(&self, selectors: &[S]) -> Result<Plan> {
        let mut wanted: VecDeque<&str> = VecDeque::new();
        for sel in selectors {
            let sel = sel.as_ref().trim();
            let prefix = format!("{sel}:");
            let matched: Vec<&str> = self
                .tasks
                .keys()
                .filter(|id| id.as_str() == sel || id.starts_with(&prefix))
                .map(String::as_str)
                .collect();
            if matched.is_empty() {
                return Err(Error::plan(format!("no task matches '{sel}'")));
            }
            wanted.extend(matched);
        }

        let mut keep: BTreeSet<&str> = BTreeSet::new();
        while let Some(id) = wanted.pop_front() {
            if !keep.insert(id) {
                continue;
            }
            wanted.extend(self.dependencies(id)?);
        }

        let mut out = Plan::default();
        for id in keep {
            if let Some(task) = self.tasks.get(id) {
                out.add(task.clone())?;
            }
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\"];\n",
                task.id,
                task.id,
                task.doc.replace('"', "'")
            ));
        }
        for id in self.tasks.keys() {
            for dep in self.dependencies(id)? {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}
