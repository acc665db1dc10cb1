//! The build-agent event loop: scan, claim, execute, report.
//!
//! The loop owns every signal file transition. For each claimed item it
//! produces exactly one `.exitcode` and one `.done`, in that order, and
//! drops the claim marker last, so a crashed pass leaves a stale
//! `.processing` file that the startup sweep reclaims.

use std::{fs, path::PathBuf, time::Duration};

use tracing::{error, info, warn};

use crate::agent::{
    executor::Executor,
    protocol::{
        self, claim, pending_applies, pending_builds, sweep_stale_claims, ApplyPaths, BuildPaths,
        BUILDS_DIR,
    },
};

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub builds_dir: PathBuf,
    pub poll_interval: Duration,
    /// Claims older than this on startup are considered abandoned.
    pub stale_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            builds_dir: PathBuf::from(BUILDS_DIR),
            poll_interval: Duration::from_secs(2),
            stale_grace: Duration::from_secs(600),
        }
    }
}

/// Runs the loop until the surrounding task is dropped (the binary selects
/// against the termination signal).
pub async fn run(config: AgentConfig, executor: &dyn Executor) {
    match sweep_stale_claims(&config.builds_dir, config.stale_grace) {
        Ok(removed) if !removed.is_empty() => {
            warn!(count = removed.len(), "removed abandoned claim markers");
        }
        Ok(_) => {}
        Err(err) => error!("failed to sweep stale claims: {err}"),
    }
    loop {
        if let Err(err) = run_once(&config, executor).await {
            error!("work scan failed: {err}");
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

/// One scan pass. Returns the number of work items executed.
pub async fn run_once(
    config: &AgentConfig,
    executor: &dyn Executor,
) -> Result<usize, protocol::Error> {
    let mut executed = 0;

    for name in pending_builds(&config.builds_dir)? {
        let item = BuildPaths::new(&config.builds_dir, &name);
        // the rename is the claim; losing it means another agent owns the item
        if !claim(&item.request(), &item.processing()) {
            continue;
        }
        info!(item = %name, "claimed build request");
        let exit_code = match executor.build(&item).await {
            Ok(exit_code) => exit_code,
            Err(err) => {
                let _ = fs::write(item.log(), format!("error: builder did not start: {err}\n"));
                -1
            }
        };
        finish(&item.exitcode(), &item.done(), &item.processing(), exit_code)?;
        info!(item = %name, exit_code, "build finished");
        executed += 1;
    }

    for name in pending_applies(&config.builds_dir)? {
        let item = ApplyPaths::new(&config.builds_dir, &name);
        if !claim(&item.trigger(), &item.processing()) {
            continue;
        }
        info!(item = %name, "claimed apply request");
        let exit_code = match executor.apply(&item).await {
            Ok(exit_code) => exit_code,
            Err(err) => {
                let _ = fs::write(item.log(), format!("error: apply did not start: {err}\n"));
                -1
            }
        };
        finish(&item.exitcode(), &item.done(), &item.processing(), exit_code)?;
        info!(item = %name, exit_code, "apply finished");
        executed += 1;
    }

    Ok(executed)
}

fn finish(
    exitcode: &std::path::Path,
    done: &std::path::Path,
    processing: &std::path::Path,
    exit_code: i32,
) -> Result<(), protocol::Error> {
    write_file(exitcode, &format!("{exit_code}\n"))?;
    protocol::touch(done)?;
    match fs::remove_file(processing) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(protocol::Error::Io {
            source,
            path: processing.to_path_buf(),
        }),
    }
}

fn write_file(path: &std::path::Path, contents: &str) -> Result<(), protocol::Error> {
    fs::write(path, contents).map_err(|source| protocol::Error::Io {
        source,
        path: path.to_path_buf(),
    })
}
