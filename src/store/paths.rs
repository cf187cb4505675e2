use std::path::{Path, PathBuf};

/// Filesystem layout for the two state roots.
///
/// `base` holds the machine-wide mesh state (registry, inboxes, claims,
/// completions, swarm lock). `project` holds per-workspace state (feed and
/// the crew layer) under `<cwd>/.pi/messenger`.
#[derive(Debug, Clone)]
pub struct Dirs {
    base: PathBuf,
    project: PathBuf,
}

impl Dirs {
    /// Resolve the layout for a working directory.
    ///
    /// `PI_MESSENGER_DIR` overrides the base root; otherwise it defaults to
    /// `~/.pi/agent/messenger` (falling back to a dot-directory under `cwd`
    /// when no home directory is resolvable, e.g. in stripped containers).
    pub fn resolve(cwd: &Path) -> Self {
        let base = std::env::var("PI_MESSENGER_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| cwd.to_path_buf())
                    .join(".pi")
                    .join("agent")
                    .join("messenger")
            });
        Self {
            base,
            project: cwd.join(".pi").join("messenger"),
        }
    }

    /// Explicit roots, for tests and embedding hosts.
    pub fn at(base: PathBuf, project: PathBuf) -> Self {
        Self { base, project }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    // -- base-root layout ---------------------------------------------------

    pub fn registry_dir(&self) -> PathBuf {
        self.base.join("registry")
    }

    pub fn presence_path(&self, name: &str) -> PathBuf {
        self.registry_dir().join(format!("{name}.json"))
    }

    pub fn inbox_root(&self) -> PathBuf {
        self.base.join("inbox")
    }

    pub fn inbox_dir(&self, name: &str) -> PathBuf {
        self.inbox_root().join(name)
    }

    pub fn claims_path(&self) -> PathBuf {
        self.base.join("claims.json")
    }

    pub fn completions_path(&self) -> PathBuf {
        self.base.join("completions.json")
    }

    pub fn swarm_lock_path(&self) -> PathBuf {
        self.base.join("swarm.lock")
    }

    pub fn auto_register_path(&self) -> PathBuf {
        self.base.join("auto-register.json")
    }

    // -- project-root layout ------------------------------------------------

    pub fn feed_path(&self) -> PathBuf {
        self.project.join("feed.jsonl")
    }

    pub fn crew_dir(&self) -> PathBuf {
        self.project.join("crew")
    }

    pub fn epics_dir(&self) -> PathBuf {
        self.crew_dir().join("epics")
    }

    pub fn epic_specs_dir(&self) -> PathBuf {
        self.crew_dir().join("specs")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.crew_dir().join("tasks")
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.crew_dir().join("blocks")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.crew_dir().join("checkpoints")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.crew_dir().join("artifacts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_hangs_off_both_roots() {
        let dir = tempdir().unwrap();
        let dirs = Dirs::at(dir.path().join("base"), dir.path().join("proj"));
        assert_eq!(
            dirs.presence_path("swift-otter"),
            dir.path().join("base/registry/swift-otter.json")
        );
        assert_eq!(
            dirs.inbox_dir("swift-otter"),
            dir.path().join("base/inbox/swift-otter")
        );
        assert_eq!(dirs.claims_path(), dir.path().join("base/claims.json"));
        assert_eq!(dirs.feed_path(), dir.path().join("proj/feed.jsonl"));
        assert_eq!(dirs.tasks_dir(), dir.path().join("proj/crew/tasks"));
    }

    #[test]
    fn env_override_wins() {
        let _guard = crate::agent::ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        unsafe { std::env::set_var("PI_MESSENGER_DIR", dir.path().join("custom")) };
        let dirs = Dirs::resolve(dir.path());
        assert_eq!(dirs.base(), dir.path().join("custom"));
        unsafe { std::env::remove_var("PI_MESSENGER_DIR") };
    }
}
