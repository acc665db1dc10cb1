//! Repository scanning for CI-config generation: walk, classify,
//! prioritize.

pub mod credentials;
pub mod llm;
pub mod prompt;
pub mod validate;

use std::{
    fs,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use walkdir::WalkDir;

/// Directories never worth reading: vendored deps and build caches.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    ".idea",
    ".kindling",
    ".next",
    ".terraform",
    ".venv",
    ".vscode",
    "__pycache__",
    "build",
    "coverage",
    "dist",
    "node_modules",
    "target",
    "vendor",
    "venv",
];

pub const MANIFEST_FILES: &[&str] = &[
    "go.mod",
    "package.json",
    "requirements.txt",
    "pyproject.toml",
    "Cargo.toml",
    "pom.xml",
    "build.gradle",
    "Gemfile",
    "composer.json",
    "mix.exs",
];

pub const SOURCE_EXTENSIONS: &[&str] = &[
    "cs", "ex", "exs", "go", "java", "js", "jsx", "php", "py", "rb", "rs", "ts", "tsx",
];

/// Read sites that mark a source file as configuration-bearing.
const ENV_READ_MARKERS: &[&str] = &[
    "os.Getenv",
    "process.env.",
    "os.environ",
    "ENV[",
    "std::env::var",
    "System.getenv",
    "getenv(",
];

/// Entry-point style file stems read before everything else.
const ENTRY_POINT_STEMS: &[&str] = &["main", "server", "app", "index", "config"];

const SNIPPET_CAP: usize = 4096;
const MAX_SOURCES: usize = 20;
const MAX_LISTING: usize = 200;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug)]
pub struct ScannedFile {
    /// Path relative to the repo root.
    pub path: String,
    /// Content, capped at [`SNIPPET_CAP`] bytes.
    pub content: String,
}

#[derive(Debug, Default)]
pub struct RepoScan {
    pub repo_name: String,
    pub listing: Vec<String>,
    pub manifests: Vec<ScannedFile>,
    pub dockerfiles: Vec<ScannedFile>,
    pub compose: Option<ScannedFile>,
    /// Source snippets, highest priority first.
    pub sources: Vec<ScannedFile>,
}

pub fn scan_repo(root: &Path) -> Result<RepoScan> {
    let repo_name = root
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "repo".to_string());

    let mut scan = RepoScan {
        repo_name,
        ..RepoScan::default()
    };
    let mut source_paths = Vec::new();

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
        })
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if scan.listing.len() < MAX_LISTING {
            scan.listing.push(relative.clone());
        }

        let file_name = entry.file_name().to_string_lossy().into_owned();
        if MANIFEST_FILES.contains(&file_name.as_str()) {
            scan.manifests.push(read_capped(entry.path(), relative)?);
        } else if file_name.starts_with("Dockerfile") {
            scan.dockerfiles.push(read_capped(entry.path(), relative)?);
        } else if (file_name == "docker-compose.yml" || file_name == "compose.yml")
            && scan.compose.is_none()
        {
            scan.compose = Some(read_capped(entry.path(), relative)?);
        } else if entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
        {
            source_paths.push((entry.path().to_path_buf(), relative));
        }
    }

    let mut ranked: Vec<(u8, ScannedFile)> = Vec::with_capacity(source_paths.len());
    for (path, relative) in source_paths {
        let file = read_capped(&path, relative)?;
        ranked.push((source_tier(&file), file));
    }
    // alphabetical within tiers: the walk is already sorted, the sort is
    // stable
    ranked.sort_by_key(|(tier, _)| *tier);
    scan.sources = ranked
        .into_iter()
        .take(MAX_SOURCES)
        .map(|(_, file)| file)
        .collect();

    Ok(scan)
}

fn source_tier(file: &ScannedFile) -> u8 {
    let stem = Path::new(&file.path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    if ENTRY_POINT_STEMS.contains(&stem.as_str()) {
        return 0;
    }
    if ENV_READ_MARKERS
        .iter()
        .any(|marker| file.content.contains(marker))
    {
        return 1;
    }
    2
}

fn read_capped(path: &Path, relative: String) -> Result<ScannedFile> {
    let raw = fs::read(path).context(ReadFileSnafu { path })?;
    let capped = &raw[..raw.len().min(SNIPPET_CAP)];
    Ok(ScannedFile {
        path: relative,
        content: String::from_utf8_lossy(capped).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn classification_covers_manifests_dockerfiles_and_compose() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "package.json", "{\"name\": \"web\"}");
        write(dir.path(), "Dockerfile", "FROM node:20");
        write(dir.path(), "services/api/Dockerfile.dev", "FROM golang:1.22");
        write(dir.path(), "docker-compose.yml", "services: {}");
        write(dir.path(), "src/index.ts", "console.log('hi')");

        let scan = scan_repo(dir.path()).unwrap();
        assert_eq!(scan.manifests.len(), 1);
        assert_eq!(scan.dockerfiles.len(), 2);
        assert!(scan.compose.is_some());
        assert_eq!(scan.sources.len(), 1);
    }

    #[test]
    fn vendor_caches_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node_modules/left-pad/index.js", "x");
        write(dir.path(), "target/debug/build.rs", "x");
        write(dir.path(), "src/main.go", "package main");

        let scan = scan_repo(dir.path()).unwrap();
        assert_eq!(scan.sources.len(), 1);
        assert!(scan.listing.iter().all(|p| !p.starts_with("node_modules")));
    }

    #[test]
    fn entry_points_rank_before_env_readers_before_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zzz/main.go", "package main");
        write(
            dir.path(),
            "aaa/helper.go",
            "package aaa\nvar x = os.Getenv(\"STRIPE_API_KEY\")",
        );
        write(dir.path(), "bbb/util.go", "package bbb");

        let scan = scan_repo(dir.path()).unwrap();
        let order: Vec<_> = scan.sources.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(order, ["zzz/main.go", "aaa/helper.go", "bbb/util.go"]);
    }

    #[test]
    fn snippets_are_size_capped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.py", &"x = 1\n".repeat(10_000));
        let scan = scan_repo(dir.path()).unwrap();
        assert_eq!(scan.sources[0].content.len(), SNIPPET_CAP);
    }
}
