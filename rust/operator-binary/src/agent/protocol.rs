//! File names and writer-side choreography of the `/builds` volume.
//!
//! Build pass, for work item `<name>`:
//! `.tar.gz` context, `.dest` target image, optional `.dockerfile`,
//! `.request` trigger, `.processing` claim, `.log`, `.exitcode`, `.done`.
//! Apply pass: the same pattern under `<name>-dse.yaml` / `.apply*`.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use snafu::{ResultExt, Snafu};

/// Mount point of the shared emptyDir in both containers.
pub const BUILDS_DIR: &str = "/builds";

/// Poll cadence of the writer while waiting for the sidecar.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default writer timeout; heavy toolchains ask for more.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to access {}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Paths of one build work item.
#[derive(Clone, Debug)]
pub struct BuildPaths {
    dir: PathBuf,
    pub name: String,
}

impl BuildPaths {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        BuildPaths {
            dir: dir.into(),
            name: name.into(),
        }
    }

    fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", self.name))
    }

    pub fn tarball(&self) -> PathBuf {
        self.path(".tar.gz")
    }
    pub fn destination(&self) -> PathBuf {
        self.path(".dest")
    }
    pub fn dockerfile(&self) -> PathBuf {
        self.path(".dockerfile")
    }
    pub fn request(&self) -> PathBuf {
        self.path(".request")
    }
    pub fn processing(&self) -> PathBuf {
        self.path(".processing")
    }
    pub fn log(&self) -> PathBuf {
        self.path(".log")
    }
    pub fn exitcode(&self) -> PathBuf {
        self.path(".exitcode")
    }
    pub fn done(&self) -> PathBuf {
        self.path(".done")
    }
}

/// Paths of one environment-apply work item (`<name>-dse.*`).
#[derive(Clone, Debug)]
pub struct ApplyPaths {
    dir: PathBuf,
    pub name: String,
}

impl ApplyPaths {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        ApplyPaths {
            dir: dir.into(),
            name: name.into(),
        }
    }

    fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}-dse{suffix}", self.name))
    }

    pub fn payload(&self) -> PathBuf {
        self.path(".yaml")
    }
    pub fn trigger(&self) -> PathBuf {
        self.path(".apply")
    }
    pub fn processing(&self) -> PathBuf {
        self.path(".apply-processing")
    }
    pub fn log(&self) -> PathBuf {
        self.path(".apply-log")
    }
    pub fn exitcode(&self) -> PathBuf {
        self.path(".apply-exitcode")
    }
    pub fn done(&self) -> PathBuf {
        self.path(".apply-done")
    }
}

/// Claims a work item by renaming its trigger file. The rename either
/// succeeds for exactly one claimant or fails because someone else got
/// there first.
pub fn claim(trigger: &Path, processing: &Path) -> bool {
    fs::rename(trigger, processing).is_ok()
}

/// Work item names with a pending `.request` trigger.
pub fn pending_builds(dir: &Path) -> Result<Vec<String>> {
    names_with_suffix(dir, ".request")
}

/// Work item names with a pending `-dse.apply` trigger.
pub fn pending_applies(dir: &Path) -> Result<Vec<String>> {
    names_with_suffix(dir, "-dse.apply")
}

fn names_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).context(IoSnafu { path: dir })?;
    for entry in entries {
        let entry = entry.context(IoSnafu { path: dir })?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(name) = file_name.strip_suffix(suffix) {
            // `web-dse.apply` must not also surface as a `.request`-style
            // name for a different suffix; suffix matching is exact.
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Removes abandoned claims on sidecar start: any `.processing` marker older
/// than the grace period belongs to a dead executor.
pub fn sweep_stale_claims(dir: &Path, grace: Duration) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let now = SystemTime::now();
    let entries = fs::read_dir(dir).context(IoSnafu { path: dir })?;
    for entry in entries {
        let entry = entry.context(IoSnafu { path: dir })?;
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(".processing") && !file_name.ends_with(".apply-processing") {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map(|age| age > grace)
            .unwrap_or(false);
        if stale {
            fs::remove_file(&path).context(IoSnafu { path: &path })?;
            removed.push(path);
        }
    }
    Ok(removed)
}

/// Writer half: cleans this item's previous signal files (never anyone
/// else's), records the destination and optional dockerfile, then raises the
/// trigger. The context tarball must already be in place.
pub fn submit_build(
    dir: &Path,
    name: &str,
    destination: &str,
    dockerfile: Option<&str>,
) -> Result<BuildPaths> {
    let paths = BuildPaths::new(dir, name);
    for path in [
        paths.destination(),
        paths.dockerfile(),
        paths.request(),
        paths.log(),
        paths.exitcode(),
        paths.done(),
    ] {
        remove_if_present(&path)?;
    }
    write_line(&paths.destination(), destination)?;
    if let Some(dockerfile) = dockerfile {
        write_line(&paths.dockerfile(), dockerfile)?;
    }
    touch(&paths.request())?;
    Ok(paths)
}

/// Writer half of the apply pass: payload first, trigger last.
pub fn submit_apply(dir: &Path, name: &str, payload: &str) -> Result<ApplyPaths> {
    let paths = ApplyPaths::new(dir, name);
    for path in [
        paths.trigger(),
        paths.log(),
        paths.exitcode(),
        paths.done(),
    ] {
        remove_if_present(&path)?;
    }
    fs::write(paths.payload(), payload).context(IoSnafu {
        path: paths.payload(),
    })?;
    touch(&paths.trigger())?;
    Ok(paths)
}

#[derive(Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Success,
    /// The sidecar finished with a nonzero exit code.
    Failed { exit_code: i32, log: String },
    /// No completion marker within the timeout.
    TimedOut { log: String },
}

pub fn wait_for_build(paths: &BuildPaths, timeout: Duration) -> Result<WaitOutcome> {
    wait_for(&paths.done(), &paths.exitcode(), &paths.log(), timeout)
}

pub fn wait_for_apply(paths: &ApplyPaths, timeout: Duration) -> Result<WaitOutcome> {
    wait_for(&paths.done(), &paths.exitcode(), &paths.log(), timeout)
}

fn wait_for(done: &Path, exitcode: &Path, log: &Path, timeout: Duration) -> Result<WaitOutcome> {
    let deadline = SystemTime::now() + timeout;
    loop {
        if done.exists() {
            break;
        }
        if SystemTime::now() >= deadline {
            return Ok(WaitOutcome::TimedOut {
                log: read_log(log),
            });
        }
        let remaining = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        std::thread::sleep(POLL_INTERVAL.min(remaining));
    }
    let exit_code = fs::read_to_string(exitcode)
        .ok()
        .and_then(|code| code.trim().parse::<i32>().ok())
        .unwrap_or(-1);
    if exit_code == 0 {
        Ok(WaitOutcome::Success)
    } else {
        Ok(WaitOutcome::Failed {
            exit_code,
            log: read_log(log),
        })
    }
}

fn read_log(log: &Path) -> String {
    fs::read_to_string(log).unwrap_or_default()
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::Io {
            source,
            path: path.to_path_buf(),
        }),
    }
}

fn write_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::File::create(path).context(IoSnafu { path })?;
    writeln!(file, "{line}").context(IoSnafu { path })?;
    Ok(())
}

pub fn touch(path: &Path) -> Result<()> {
    fs::File::create(path).map(|_| ()).context(IoSnafu { path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_paths_follow_the_naming_contract() {
        let paths = BuildPaths::new("/builds", "api");
        assert_eq!(paths.tarball(), PathBuf::from("/builds/api.tar.gz"));
        assert_eq!(paths.request(), PathBuf::from("/builds/api.request"));
        assert_eq!(paths.processing(), PathBuf::from("/builds/api.processing"));
        assert_eq!(paths.done(), PathBuf::from("/builds/api.done"));
    }

    #[test]
    fn apply_paths_follow_the_naming_contract() {
        let paths = ApplyPaths::new("/builds", "api");
        assert_eq!(paths.payload(), PathBuf::from("/builds/api-dse.yaml"));
        assert_eq!(paths.trigger(), PathBuf::from("/builds/api-dse.apply"));
        assert_eq!(
            paths.exitcode(),
            PathBuf::from("/builds/api-dse.apply-exitcode")
        );
    }

    #[test]
    fn submit_build_raises_the_trigger_last() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("api.tar.gz"), b"context").unwrap();
        let paths = submit_build(dir.path(), "api", "registry:5000/api:v1", None).unwrap();
        assert_eq!(
            fs::read_to_string(paths.destination()).unwrap(),
            "registry:5000/api:v1\n"
        );
        assert!(paths.request().exists());
        assert!(!paths.dockerfile().exists());
    }

    #[test]
    fn submit_build_clears_stale_results_of_the_same_item_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("api.done"), b"").unwrap();
        fs::write(dir.path().join("api.exitcode"), b"1").unwrap();
        fs::write(dir.path().join("other.done"), b"").unwrap();

        submit_build(dir.path(), "api", "registry:5000/api:v2", Some("Dockerfile")).unwrap();

        assert!(!dir.path().join("api.done").exists());
        assert!(!dir.path().join("api.exitcode").exists());
        // parallel jobs' files stay untouched
        assert!(dir.path().join("other.done").exists());
    }

    #[test]
    fn claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BuildPaths::new(dir.path(), "api");
        touch(&paths.request()).unwrap();
        assert!(claim(&paths.request(), &paths.processing()));
        // the second claimant loses
        assert!(!claim(&paths.request(), &paths.processing()));
        assert!(paths.processing().exists());
    }

    #[test]
    fn pending_scans_are_suffix_exact() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("api.request")).unwrap();
        touch(&dir.path().join("web.request")).unwrap();
        touch(&dir.path().join("web-dse.apply")).unwrap();
        touch(&dir.path().join("web-dse.apply-done")).unwrap();
        touch(&dir.path().join("api.tar.gz")).unwrap();

        assert_eq!(pending_builds(dir.path()).unwrap(), ["api", "web"]);
        assert_eq!(pending_applies(dir.path()).unwrap(), ["web"]);
    }

    #[test]
    fn stale_claims_are_swept_but_fresh_ones_survive() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("old.processing");
        let fresh = dir.path().join("new.processing");
        touch(&stale).unwrap();
        touch(&fresh).unwrap();

        let removed = sweep_stale_claims(dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(removed.is_empty());

        let removed = sweep_stale_claims(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!stale.exists());
    }

    #[test]
    fn wait_reports_failure_with_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BuildPaths::new(dir.path(), "api");
        fs::write(paths.log(), "boom\n").unwrap();
        fs::write(paths.exitcode(), "1\n").unwrap();
        touch(&paths.done()).unwrap();

        let outcome = wait_for_build(&paths, Duration::from_secs(1)).unwrap();
        assert_eq!(
            outcome,
            WaitOutcome::Failed {
                exit_code: 1,
                log: "boom\n".to_string()
            }
        );
    }

    #[test]
    fn wait_times_out_without_a_done_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BuildPaths::new(dir.path(), "api");
        fs::write(paths.log(), "still building\n").unwrap();
        let outcome = wait_for_build(&paths, Duration::ZERO).unwrap();
        assert_eq!(
            outcome,
            WaitOutcome::TimedOut {
                log: "still building\n".to_string()
            }
        );
    }
}
