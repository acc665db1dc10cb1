//! The `kindling` developer CLI: thin adapters over the declared resources,
//! the repo scanner and the intel context manager. Cluster provisioning,
//! image loading and tunnel management live in separate host tooling.

use std::{collections::BTreeMap, path::PathBuf, process::exit};

use chrono::Utc;
use clap::{Parser, Subcommand};
use kindling_operator::{
    agent::executor::apply_object,
    crd::{
        runner::{RunnerPool, RunnerPoolSpec, TokenSecretRef},
        sanitize_label, API_VERSION,
    },
    intel::IntelManager,
    provider::{self, Provider},
    scan::{
        self,
        credentials::{detect_credentials, detect_oauth},
        llm::{generate_config, LlmConfig, LlmProvider},
        prompt::{build_prompt, PromptOptions},
        validate::validate_config,
    },
};
use serde::Deserialize;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{DynamicObject, ObjectMeta, Patch, PatchParams},
        config::KubeConfigOptions,
        Api,
    },
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const FIELD_MANAGER: &str = "kindling-cli";

#[derive(Parser)]
#[clap(name = "kindling", about, author, version)]
struct Opts {
    /// Cluster name; selects the matching k3d kubeconfig context.
    #[clap(short, long, global = true)]
    cluster: Option<String>,
    /// Project directory.
    #[clap(short = 'p', long, global = true, default_value = ".")]
    project_dir: PathBuf,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply a declared environment from a YAML file.
    Deploy {
        #[clap(short, long)]
        file: PathBuf,
        #[clap(short, long)]
        namespace: Option<String>,
    },
    /// Create or update the runner pool for a repository.
    Runners {
        /// Your username on the CI platform.
        #[clap(short, long)]
        username: String,
        /// Repository slug (owner/repo, group/project, org/project).
        #[clap(short, long)]
        repository: String,
        /// Platform credential; prompted for when omitted.
        #[clap(short, long)]
        token: Option<String>,
        #[clap(long)]
        platform: Option<String>,
        /// Platform URL override for self-hosted instances.
        #[clap(long)]
        url: Option<String>,
        #[clap(short, long)]
        namespace: Option<String>,
        #[clap(long, default_value_t = 1)]
        replicas: i32,
    },
    /// Generate a CI config for the repository.
    Generate {
        #[clap(short = 'k', long)]
        api_key: String,
        /// Repository to scan; defaults to the project directory.
        #[clap(short, long)]
        repo: Option<PathBuf>,
        /// LLM provider: anthropic or openai.
        #[clap(long, default_value = "anthropic")]
        provider: String,
        #[clap(long)]
        model: Option<String>,
        /// Output path; defaults to the platform's canonical location.
        #[clap(short, long)]
        out: Option<PathBuf>,
        /// CI platform; defaults to the registry default.
        #[clap(long)]
        platform: Option<String>,
        /// Username whose runner label the generated jobs target.
        #[clap(short, long)]
        username: Option<String>,
        #[clap(long, default_value = "main")]
        branch: String,
        /// Print the config instead of writing it.
        #[clap(long)]
        dry_run: bool,
    },
    /// Manage the per-repo agent context.
    Intel {
        #[clap(subcommand)]
        cmd: IntelCmd,
    },
    /// Print version information.
    Version,
}

#[derive(Subcommand)]
enum IntelCmd {
    On,
    Off,
    Status,
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    exit(run(opts).await);
}

async fn run(opts: Opts) -> i32 {
    match opts.cmd {
        Cmd::Deploy { file, namespace } => deploy(opts.cluster.as_deref(), &file, namespace).await,
        Cmd::Runners {
            username,
            repository,
            token,
            platform,
            url,
            namespace,
            replicas,
        } => {
            runners(
                opts.cluster.as_deref(),
                &username,
                &repository,
                token,
                platform.as_deref(),
                url,
                namespace,
                replicas,
            )
            .await
        }
        Cmd::Generate {
            api_key,
            repo,
            provider,
            model,
            out,
            platform,
            username,
            branch,
            dry_run,
        } => {
            generate(
                repo.unwrap_or(opts.project_dir),
                &api_key,
                &provider,
                model,
                out,
                platform.as_deref(),
                username,
                &branch,
                dry_run,
            )
            .await
        }
        Cmd::Intel { cmd } => intel(&opts.project_dir, cmd),
        Cmd::Version => {
            println!(
                "kindling {} ({})",
                built_info::PKG_VERSION,
                built_info::GIT_VERSION.unwrap_or("unknown revision"),
            );
            0
        }
    }
}

fn resolve_platform(platform: Option<&str>) -> Option<&'static Provider> {
    match platform {
        Some(name) => provider::get(name),
        None => Some(provider::default_provider()),
    }
}

async fn kube_client(cluster: Option<&str>) -> Result<kube::Client, kube::Error> {
    if let Some(cluster) = cluster {
        let options = KubeConfigOptions {
            context: Some(format!("k3d-{cluster}")),
            ..KubeConfigOptions::default()
        };
        if let Ok(config) = kube::Config::from_kubeconfig(&options).await {
            return kube::Client::try_from(config);
        }
    }
    kube::Client::try_default().await
}

async fn deploy(cluster: Option<&str>, file: &PathBuf, namespace: Option<String>) -> i32 {
    let raw = match std::fs::read_to_string(file) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("error: cannot read {}: {err}", file.display());
            return 2;
        }
    };

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&raw) {
        let mut object = match DynamicObject::deserialize(document) {
            Ok(object) => object,
            Err(err) => {
                eprintln!("error: invalid YAML in {}: {err}", file.display());
                return 2;
            }
        };
        let api_version = object
            .types
            .as_ref()
            .map(|t| t.api_version.clone())
            .unwrap_or_default();
        if api_version != API_VERSION {
            eprintln!(
                "error: {} declares apiVersion {api_version:?}; this tool only applies {API_VERSION}",
                file.display()
            );
            return 2;
        }
        if object.metadata.namespace.is_none() {
            object.metadata.namespace = namespace.clone();
        }
        objects.push(object);
    }
    if objects.is_empty() {
        eprintln!("error: {} contains no resources", file.display());
        return 2;
    }

    let client = match kube_client(cluster).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("error: cannot connect to the cluster: {err}");
            return 3;
        }
    };
    for object in &objects {
        match apply_object(&client, object).await {
            Ok(description) => println!("applied {description}"),
            Err(err) => {
                eprintln!("error: {err}");
                return 3;
            }
        }
    }
    0
}

#[allow(clippy::too_many_arguments)]
async fn runners(
    cluster: Option<&str>,
    username: &str,
    repository: &str,
    token: Option<String>,
    platform: Option<&str>,
    url: Option<String>,
    namespace: Option<String>,
    replicas: i32,
) -> i32 {
    let Some(provider) = resolve_platform(platform) else {
        eprintln!("error: unknown platform {:?}", platform.unwrap_or_default());
        return 2;
    };

    let token = match token {
        Some(token) => token,
        None => {
            eprintln!(
                "Enter your {} ({}):",
                provider.cli_labels.token_hint, provider.display_name
            );
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(_) if !line.trim().is_empty() => line.trim().to_string(),
                _ => {
                    eprintln!("aborted: no token provided");
                    return 1;
                }
            }
        }
    };

    let sanitized = sanitize_label(username);
    let secret_name = format!("{sanitized}-runner-token");
    let secret_key = provider.runner.default_secret_key;

    let client = match kube_client(cluster).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("error: cannot connect to the cluster: {err}");
            return 2;
        }
    };

    let namespace = namespace.unwrap_or_else(|| "default".to_string());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.clone()),
            ..ObjectMeta::default()
        },
        string_data: Some(BTreeMap::from([(secret_key.to_string(), token)])),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    };
    if let Err(err) = secrets
        .patch(
            &secret_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
    {
        eprintln!("error: failed to apply token secret: {err}");
        return 2;
    }

    let pools: Api<RunnerPool> = Api::namespaced(client, &namespace);
    let pool = RunnerPool::new(
        &sanitized,
        RunnerPoolSpec {
            platform: Some(provider.name.to_string()),
            username: username.to_string(),
            repository: repository.to_string(),
            platform_url: url,
            token_secret_ref: TokenSecretRef {
                name: secret_name,
                key: Some(secret_key.to_string()),
            },
            replicas: Some(replicas),
            runner_image: None,
            labels: Vec::new(),
            runner_group: None,
            resources: None,
            service_account_name: None,
            work_dir: None,
            extra_env: Vec::new(),
            extra_volumes: Vec::new(),
            extra_volume_mounts: Vec::new(),
            cluster_operation: Default::default(),
        },
    );
    match pools
        .patch(
            &sanitized,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&pool),
        )
        .await
    {
        Ok(_) => {
            println!(
                "runner pool {sanitized} ready: {} runner(s) for {repository} on {}",
                replicas, provider.display_name
            );
            0
        }
        Err(err) => {
            eprintln!("error: failed to apply runner pool: {err}");
            2
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn generate(
    repo: PathBuf,
    api_key: &str,
    llm_provider: &str,
    model: Option<String>,
    out: Option<PathBuf>,
    platform: Option<&str>,
    username: Option<String>,
    branch: &str,
    dry_run: bool,
) -> i32 {
    let Some(provider) = resolve_platform(platform) else {
        eprintln!("error: unknown platform {:?}", platform.unwrap_or_default());
        return 2;
    };

    let scan = match scan::scan_repo(&repo) {
        Ok(scan) => scan,
        Err(err) => {
            eprintln!("error: scan failed: {err}");
            return 2;
        }
    };
    let credentials = detect_credentials(&scan);
    let oauth = detect_oauth(&scan);

    let username_label = sanitize_label(
        &username
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "dev".to_string()),
    );
    let options = PromptOptions {
        host_arch: host_arch(),
        default_branch: branch,
        username_label: &username_label,
    };
    let prompt = build_prompt(provider, &scan, &credentials, &oauth, &options);

    let llm_provider = match llm_provider.parse::<LlmProvider>() {
        Ok(llm_provider) => llm_provider,
        Err(err) => {
            eprintln!("error: {err}");
            return 3;
        }
    };
    let config = LlmConfig {
        provider: llm_provider,
        api_key: api_key.to_string(),
        model,
    };
    let generated = match generate_config(&config, &prompt.system, &prompt.user).await {
        Ok(generated) => generated,
        Err(err) => {
            eprintln!("error: LLM call failed: {err}");
            return 3;
        }
    };

    let violations = validate_config(provider, &generated, &credentials);
    if !violations.is_empty() {
        eprintln!("generated config failed validation:");
        for violation in &violations {
            eprintln!("  - {violation}");
        }
        return 4;
    }

    if dry_run {
        println!("{generated}");
        return 0;
    }
    let out = out.unwrap_or_else(|| repo.join(provider.workflow.output_path));
    if let Some(parent) = out.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("error: cannot create {}: {err}", parent.display());
            return 2;
        }
    }
    match std::fs::write(&out, format!("{generated}\n")) {
        Ok(()) => {
            println!("wrote {}", out.display());
            0
        }
        Err(err) => {
            eprintln!("error: cannot write {}: {err}", out.display());
            2
        }
    }
}

fn intel(project_dir: &PathBuf, cmd: IntelCmd) -> i32 {
    let manager = IntelManager::new(project_dir);
    let result = match cmd {
        IntelCmd::On => manager.enable(Utc::now()).map(|()| {
            println!("intel context installed");
        }),
        IntelCmd::Off => manager.deactivate(true).map(|()| {
            println!("intel context removed; originals restored");
        }),
        IntelCmd::Status => {
            let disabled = manager.is_disabled();
            match manager.load_state() {
                Ok(state) => {
                    let active = state.as_ref().map(|s| s.active).unwrap_or(false);
                    println!(
                        "intel: {}{}",
                        if active { "active" } else { "inactive" },
                        if disabled { " (disabled)" } else { "" },
                    );
                    if let Some(state) = state {
                        println!("  last interaction: {}", state.last_interaction);
                        println!("  managed files: {}", state.written.join(", "));
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
    };
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "linux/amd64",
        "aarch64" => "linux/arm64",
        other => other,
    }
}
