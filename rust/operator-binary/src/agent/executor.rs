//! Privileged execution behind the build-agent loop: the daemonless image
//! builder and the in-cluster environment apply.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    process::Stdio,
};

use futures::future::BoxFuture;
use serde::Deserialize;
use stackable_operator::kube::{
    self,
    api::{DynamicObject, Patch, PatchParams},
    core::GroupVersionKind,
    discovery, Api,
};
use tokio::process::Command;
use tracing::{info, warn};

use crate::agent::protocol::{ApplyPaths, BuildPaths};

pub const FIELD_MANAGER: &str = "kindling-build-agent";
pub const DEFAULT_BUILDER_PATH: &str = "/kaniko/executor";
pub const DEFAULT_CACHE_REPO: &str = "registry:5000/cache";

/// The privileged half of the protocol. The loop in [`crate::agent::server`]
/// owns all signal files; an executor only produces a log and an exit code.
pub trait Executor: Send + Sync {
    fn build<'a>(&'a self, item: &'a BuildPaths) -> BoxFuture<'a, io::Result<i32>>;
    fn apply<'a>(&'a self, item: &'a ApplyPaths) -> BoxFuture<'a, io::Result<i32>>;
}

/// Builds via kaniko and applies via the pod's service account.
pub struct KanikoExecutor {
    pub builder_path: PathBuf,
    /// Layer cache within the in-cluster registry; `None` disables caching.
    pub cache_repo: Option<String>,
}

impl Default for KanikoExecutor {
    fn default() -> Self {
        KanikoExecutor {
            builder_path: PathBuf::from(DEFAULT_BUILDER_PATH),
            cache_repo: Some(DEFAULT_CACHE_REPO.to_string()),
        }
    }
}

impl KanikoExecutor {
    fn builder_args(&self, item: &BuildPaths, destination: &str) -> Vec<String> {
        let mut args = vec![
            format!("--context=tar://{}", item.tarball().display()),
            format!("--destination={destination}"),
            // the in-cluster registry speaks plain HTTP
            "--insecure".to_string(),
            "--insecure-pull".to_string(),
        ];
        if let Ok(dockerfile) = std::fs::read_to_string(item.dockerfile()) {
            let dockerfile = dockerfile.trim();
            if !dockerfile.is_empty() {
                args.push(format!("--dockerfile={dockerfile}"));
            }
        }
        if let Some(cache_repo) = &self.cache_repo {
            args.push("--cache=true".to_string());
            args.push(format!("--cache-repo={cache_repo}"));
        }
        args
    }

    async fn run_build(&self, item: &BuildPaths) -> io::Result<i32> {
        let destination = std::fs::read_to_string(item.destination())?;
        let destination = destination.trim().to_string();
        if destination.is_empty() {
            let mut log = File::create(item.log())?;
            writeln!(log, "error: empty destination for work item {}", item.name)?;
            return Ok(1);
        }

        let log = File::create(item.log())?;
        let stderr_log = log.try_clone()?;
        info!(item = %item.name, %destination, "starting image build");
        let status = Command::new(&self.builder_path)
            .args(self.builder_args(item, &destination))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn run_apply(&self, item: &ApplyPaths) -> io::Result<i32> {
        let payload = std::fs::read_to_string(item.payload())?;
        let mut log = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(item.log())?;

        let client = match kube::Client::try_default().await {
            Ok(client) => client,
            Err(err) => {
                writeln!(log, "error: no cluster access from the pod: {err}")?;
                return Ok(1);
            }
        };

        for document in serde_yaml::Deserializer::from_str(&payload) {
            let object = match DynamicObject::deserialize(document) {
                Ok(object) => object,
                Err(err) => {
                    writeln!(log, "error: invalid resource document: {err}")?;
                    return Ok(1);
                }
            };
            match apply_object(&client, &object).await {
                Ok(description) => writeln!(log, "applied {description}")?,
                Err(err) => {
                    writeln!(log, "error: apply failed: {err}")?;
                    return Ok(1);
                }
            }
        }
        Ok(0)
    }
}

/// Server-side-applies one dynamic object, resolving its kind through API
/// discovery. Returns a human-readable description of what was applied.
pub async fn apply_object(client: &kube::Client, object: &DynamicObject) -> Result<String, String> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| "document has no apiVersion/kind".to_string())?;
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    let gvk = GroupVersionKind::gvk(group, version, &types.kind);
    let (api_resource, _caps) = discovery::pinned_kind(client, &gvk)
        .await
        .map_err(|err| format!("unknown kind {}/{}: {err}", types.api_version, types.kind))?;

    let name = object
        .metadata
        .name
        .clone()
        .ok_or_else(|| "document has no metadata.name".to_string())?;
    let api: Api<DynamicObject> = match &object.metadata.namespace {
        Some(namespace) => Api::namespaced_with(client.clone(), namespace, &api_resource),
        None => Api::default_namespaced_with(client.clone(), &api_resource),
    };
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await
    .map_err(|err| err.to_string())?;
    Ok(format!("{}/{} {name}", types.api_version, types.kind))
}

impl Executor for KanikoExecutor {
    fn build<'a>(&'a self, item: &'a BuildPaths) -> BoxFuture<'a, io::Result<i32>> {
        Box::pin(self.run_build(item))
    }

    fn apply<'a>(&'a self, item: &'a ApplyPaths) -> BoxFuture<'a, io::Result<i32>> {
        Box::pin(async move {
            let code = self.run_apply(item).await?;
            if code != 0 {
                warn!(item = %item.name, "environment apply failed");
            }
            Ok(code)
        })
    }
}
