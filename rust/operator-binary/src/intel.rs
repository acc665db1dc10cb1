//! Per-repo agent-context management.
//!
//! Keeps a generated context file in front of the developer's coding
//! assistant without clobbering anything: files that already exist are
//! backed up before being overwritten and restored byte-identically on
//! deactivation. All state lives under `.kindling/` in the repo. This is a
//! best-effort local tool; concurrent invocations are not synchronized.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use indoc::formatdoc;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use walkdir::WalkDir;

pub const STATE_DIR: &str = ".kindling";
const STATE_FILE: &str = "intel-state.json";
const DISABLED_MARKER: &str = "intel-disabled";
const BACKUP_DIR: &str = "backups";

/// First line of every context this tool writes; files without it are the
/// developer's own and get backed up.
pub const CONTEXT_MARKER: &str = "<!-- kindling:intel -->";

/// The agent-context files the tool knows how to install.
pub const AGENT_TARGETS: &[&str] = &["CLAUDE.md", "AGENTS.md", ".cursorrules"];

/// A session older than this is treated as finished: originals come back
/// before a fresh context is generated.
pub const SESSION_TIMEOUT_MINUTES: i64 = 60;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to access {}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("state file is corrupt"))]
    CorruptState { source: serde_json::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IntelState {
    pub active: bool,
    #[serde(default)]
    pub backups: BTreeMap<String, String>,
    #[serde(default)]
    pub written: Vec<String>,
    pub last_interaction: DateTime<Utc>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum SessionAction {
    /// The opt-out marker is set; nothing was touched.
    Disabled,
    /// A fresh context was installed.
    Activated,
    /// The previous session expired: originals restored, new context
    /// installed.
    Restarted,
    /// The session is live; only the timestamp moved.
    Refreshed,
}

pub struct IntelManager {
    repo_root: PathBuf,
}

impl IntelManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        IntelManager {
            repo_root: repo_root.into(),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.repo_root.join(STATE_DIR)
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    fn disabled_path(&self) -> PathBuf {
        self.state_dir().join(DISABLED_MARKER)
    }

    fn backup_dir(&self) -> PathBuf {
        self.state_dir().join(BACKUP_DIR)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_path().exists()
    }

    pub fn load_state(&self) -> Result<Option<IntelState>> {
        let path = self.state_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Io { source, path }),
        };
        serde_json::from_str(&raw).context(CorruptStateSnafu).map(Some)
    }

    fn save_state(&self, state: &IntelState) -> Result<()> {
        let dir = self.state_dir();
        fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;
        let path = self.state_path();
        let raw = serde_json::to_string_pretty(state).context(CorruptStateSnafu)?;
        fs::write(&path, raw).context(IoSnafu { path })
    }

    /// Hook run before any top-level command.
    pub fn ensure_session(&self, now: DateTime<Utc>) -> Result<SessionAction> {
        if self.is_disabled() {
            return Ok(SessionAction::Disabled);
        }
        match self.load_state()? {
            Some(state) if state.active => {
                let stale = now - state.last_interaction
                    > Duration::minutes(SESSION_TIMEOUT_MINUTES);
                if stale {
                    self.deactivate(false)?;
                    self.activate(now)?;
                    Ok(SessionAction::Restarted)
                } else {
                    self.save_state(&IntelState {
                        last_interaction: now,
                        ..state
                    })?;
                    Ok(SessionAction::Refreshed)
                }
            }
            _ => {
                self.activate(now)?;
                Ok(SessionAction::Activated)
            }
        }
    }

    /// Installs the generated context into every known agent-file target,
    /// backing up whatever the developer already had.
    pub fn activate(&self, now: DateTime<Utc>) -> Result<()> {
        let backup_dir = self.backup_dir();
        fs::create_dir_all(&backup_dir).context(IoSnafu { path: &backup_dir })?;

        let mut state = IntelState {
            active: true,
            last_interaction: now,
            ..self.load_state()?.unwrap_or_default()
        };
        let context = self.generate_context();

        for target in AGENT_TARGETS {
            let target_path = self.repo_root.join(target);
            if target_path.exists() && !state.backups.contains_key(*target) {
                let content =
                    fs::read_to_string(&target_path).context(IoSnafu { path: &target_path })?;
                if !content.contains(CONTEXT_MARKER) {
                    let backup_path = backup_dir.join(format!("{}.bak", target.replace('/', "_")));
                    fs::copy(&target_path, &backup_path)
                        .context(IoSnafu { path: &backup_path })?;
                    state
                        .backups
                        .insert(target.to_string(), backup_path.display().to_string());
                }
            }
            fs::write(&target_path, &context).context(IoSnafu { path: &target_path })?;
            if !state.written.iter().any(|written| written == target) {
                state.written.push(target.to_string());
            }
        }
        self.save_state(&state)
    }

    /// Restores every backup, removes targets created from scratch, and
    /// optionally sets the opt-out marker.
    pub fn deactivate(&self, set_disabled: bool) -> Result<()> {
        if let Some(state) = self.load_state()? {
            for target in &state.written {
                let target_path = self.repo_root.join(target);
                match state.backups.get(target) {
                    Some(backup) => {
                        fs::copy(backup, &target_path).context(IoSnafu { path: &target_path })?;
                    }
                    None => {
                        match fs::remove_file(&target_path) {
                            Ok(()) => {}
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                            Err(source) => {
                                return Err(Error::Io {
                                    source,
                                    path: target_path,
                                })
                            }
                        }
                    }
                }
            }
            self.save_state(&IntelState {
                active: false,
                backups: BTreeMap::new(),
                written: Vec::new(),
                ..state
            })?;
        }
        if set_disabled {
            let path = self.disabled_path();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
            }
            fs::write(&path, b"").context(IoSnafu { path })?;
        }
        Ok(())
    }

    /// `intel on`: clears the opt-out marker and installs the context.
    pub fn enable(&self, now: DateTime<Utc>) -> Result<()> {
        let marker = self.disabled_path();
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(Error::Io { source, path: marker }),
        }
        self.activate(now)
    }

    /// Facts about the repo woven into the generated context.
    fn repo_facts(&self) -> RepoFacts {
        let mut facts = RepoFacts::default();
        let known_manifests = [
            "go.mod",
            "package.json",
            "requirements.txt",
            "pyproject.toml",
            "Cargo.toml",
            "pom.xml",
            "build.gradle",
            "Gemfile",
        ];
        for entry in WalkDir::new(&self.repo_root)
            .max_depth(3)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                name != STATE_DIR && name != ".git"
            })
            .flatten()
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if known_manifests.contains(&name.as_str()) && !facts.manifests.contains(&name) {
                facts.manifests.push(name.clone());
            }
            if name.starts_with("Dockerfile") {
                facts.dockerfiles += 1;
            }
            if name == "docker-compose.yml" || name == "compose.yml" {
                facts.has_compose = true;
            }
        }
        facts.has_workflows = self.repo_root.join(".github/workflows").is_dir()
            || self.repo_root.join(".gitlab-ci.yml").exists()
            || self.repo_root.join(".circleci/config.yml").exists();
        facts.manifests.sort();
        facts
    }

    pub fn generate_context(&self) -> String {
        let facts = self.repo_facts();
        let manifests = if facts.manifests.is_empty() {
            "none detected".to_string()
        } else {
            facts.manifests.join(", ")
        };
        formatdoc! {"
            {CONTEXT_MARKER}
            # Kindling dev-staging context

            This repository deploys to a personal in-cluster dev-staging
            environment. Pushing to the default branch triggers the CI
            pipeline, which builds images inside the cluster and applies a
            DevStagingEnvironment resource.

            Repo facts:
            - Language manifests: {manifests}
            - Dockerfiles: {dockerfiles}
            - CI workflow present: {has_workflows}
            - docker-compose present: {has_compose}

            Useful rules:
            - Backing services (postgres, redis, ...) are declared under
              `dependencies` in the environment resource; connection URLs are
              injected automatically (DATABASE_URL, REDIS_URL, ...).
            - Images are pushed to the in-cluster registry `registry:5000`.
            - Never run `rm -f /builds/*`; build signal files are scoped per
              work item.
        ",
            dockerfiles = facts.dockerfiles,
            has_workflows = facts.has_workflows,
            has_compose = facts.has_compose,
        }
    }
}

#[derive(Debug, Default)]
struct RepoFacts {
    manifests: Vec<String>,
    dockerfiles: usize,
    has_workflows: bool,
    has_compose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, IntelManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = IntelManager::new(dir.path());
        (dir, manager)
    }

    #[test]
    fn activate_then_deactivate_restores_originals_byte_identically() {
        let (dir, manager) = manager();
        let original = "my own claude notes\nwith preferences\n";
        fs::write(dir.path().join("CLAUDE.md"), original).unwrap();

        manager.activate(Utc::now()).unwrap();
        let installed = fs::read_to_string(dir.path().join("CLAUDE.md")).unwrap();
        assert!(installed.starts_with(CONTEXT_MARKER));

        manager.deactivate(true).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("CLAUDE.md")).unwrap(),
            original
        );
        assert!(manager.is_disabled());
    }

    #[test]
    fn targets_created_from_scratch_are_removed_on_deactivate() {
        let (dir, manager) = manager();
        manager.activate(Utc::now()).unwrap();
        assert!(dir.path().join("AGENTS.md").exists());

        manager.deactivate(false).unwrap();
        assert!(!dir.path().join("AGENTS.md").exists());
        assert!(!manager.is_disabled());
    }

    #[test]
    fn disabled_marker_blocks_auto_activation() {
        let (dir, manager) = manager();
        manager.deactivate(true).unwrap();
        assert_eq!(
            manager.ensure_session(Utc::now()).unwrap(),
            SessionAction::Disabled
        );
        assert!(!dir.path().join("CLAUDE.md").exists());
    }

    #[test]
    fn fresh_repo_auto_activates() {
        let (dir, manager) = manager();
        assert_eq!(
            manager.ensure_session(Utc::now()).unwrap(),
            SessionAction::Activated
        );
        assert!(dir.path().join("CLAUDE.md").exists());
    }

    #[test]
    fn live_session_only_refreshes_the_timestamp() {
        let (_dir, manager) = manager();
        let start = Utc::now();
        manager.activate(start).unwrap();
        let later = start + Duration::minutes(5);
        assert_eq!(
            manager.ensure_session(later).unwrap(),
            SessionAction::Refreshed
        );
        let state = manager.load_state().unwrap().unwrap();
        assert_eq!(state.last_interaction, later);
    }

    #[test]
    fn stale_session_restores_and_reactivates() {
        let (dir, manager) = manager();
        let original = "pre-existing agents file\n";
        fs::write(dir.path().join("AGENTS.md"), original).unwrap();

        let start = Utc::now();
        manager.activate(start).unwrap();
        let much_later = start + Duration::minutes(SESSION_TIMEOUT_MINUTES + 5);
        assert_eq!(
            manager.ensure_session(much_later).unwrap(),
            SessionAction::Restarted
        );

        // still active with a fresh context, and the original is still the
        // recorded backup
        let state = manager.load_state().unwrap().unwrap();
        assert!(state.active);
        let installed = fs::read_to_string(dir.path().join("AGENTS.md")).unwrap();
        assert!(installed.starts_with(CONTEXT_MARKER));
        manager.deactivate(false).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("AGENTS.md")).unwrap(),
            original
        );
    }

    #[test]
    fn repo_facts_feed_the_context() {
        let (dir, manager) = manager();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM node").unwrap();
        fs::write(dir.path().join("docker-compose.yml"), "services: {}").unwrap();

        let context = manager.generate_context();
        assert!(context.contains("package.json"));
        assert!(context.contains("Dockerfiles: 1"));
        assert!(context.contains("docker-compose present: true"));
    }
}
