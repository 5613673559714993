//! Project identity: the partition key for sessions, approvals, and busy state.
//!
//! Directories inside one git repository resolve to the same project (the
//! repository's first root commit), so their state is shared. Anything
//! outside version control belongs to the `global` project.

use std::path::{Path, PathBuf};
use std::process::Command;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::ProjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    Git,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub worktree: PathBuf,
    /// Checkout the directory was resolved from (differs from `worktree` for
    /// linked worktrees).
    pub sandbox: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs: Option<Vcs>,
}

impl Project {
    pub fn global() -> Self {
        Self {
            id: ProjectId::global(),
            worktree: PathBuf::from("/"),
            sandbox: PathBuf::from("/"),
            vcs: None,
        }
    }

    /// Resolve the project that owns `directory`.
    pub fn resolve(directory: &Path) -> Self {
        let Some(sandbox) = run_git(directory, &["rev-parse", "--show-toplevel"]) else {
            return Self::global();
        };
        let sandbox = PathBuf::from(sandbox);

        let mut roots: Vec<String> = run_git(&sandbox, &["rev-list", "--max-parents=0", "--all"])
            .map(|out| {
                out.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        roots.sort();

        let Some(root) = roots.into_iter().next() else {
            return Self {
                id: ProjectId::global(),
                worktree: sandbox.clone(),
                sandbox,
                vcs: Some(Vcs::Git),
            };
        };

        let mut worktree = sandbox.clone();
        if let Some(common_dir) = run_git(&sandbox, &["rev-parse", "--git-common-dir"]) {
            if let Some(parent) = Path::new(&common_dir).parent() {
                if !parent.as_os_str().is_empty() && parent != Path::new(".") {
                    worktree = sandbox.join(parent);
                }
            }
        }

        tracing::debug!(project_id = %root, worktree = %worktree.display(), "resolved git project");
        Self {
            id: ProjectId::new(root),
            worktree,
            sandbox,
            vcs: Some(Vcs::Git),
        }
    }
}

fn run_git(cwd: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Caches directory -> project resolution.
#[derive(Debug, Default)]
pub struct ProjectResolver {
    cache: DashMap<PathBuf, Project>,
}

impl ProjectResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, directory: &Path) -> Project {
        let key = std::fs::canonicalize(directory).unwrap_or_else(|_| directory.to_path_buf());
        if let Some(project) = self.cache.get(&key) {
            return project.clone();
        }
        let project = Project::resolve(&key);
        self.cache.insert(key, project.clone());
        project
    }
}
