//! Project discovery.
//!
//! Breadth-first walk from a root, visiting each level in bounded parallel chunks. A
//! directory qualifies when its `package.json` has a non-empty `dev` script, it is not
//! under an example/sample path, and at least one framework tag is detected.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::config::IndexSettings;
use crate::resolver::{read_manifest, PackageManager};

const DENY_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "out",
    "target",
    "coverage",
    "vendor",
    "Library",
    "Applications",
    "__pycache__",
    "venv",
];

const EXCLUDED_PATTERNS: &[&str] = &["**/example", "**/examples", "**/sample", "**/samples"];

const DEPENDENCY_TAGS: &[(&str, &str)] = &[
    ("next", "next"),
    ("vite", "vite"),
    ("react", "react"),
    ("vue", "vue"),
    ("svelte", "svelte"),
    ("@sveltejs/kit", "sveltekit"),
    ("nuxt", "nuxt"),
    ("astro", "astro"),
    ("@angular/core", "angular"),
    ("@remix-run/react", "remix"),
    ("solid-js", "solid"),
    ("preact", "preact"),
    ("gatsby", "gatsby"),
    ("webpack", "webpack"),
];

/// Config file name prefixes (or exact names) that imply a tag.
const CONFIG_TAGS: &[(&str, &str)] = &[
    ("vite.config.", "vite"),
    ("next.config.", "next"),
    ("nuxt.config.", "nuxt"),
    ("astro.config.", "astro"),
    ("svelte.config.", "svelte"),
    ("angular.json", "angular"),
    ("webpack.config.", "webpack"),
    ("remix.config.", "remix"),
    ("gatsby-config.", "gatsby"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub path: PathBuf,
    pub name: String,
    pub dev_script: String,
    pub package_manager: PackageManager,
    pub workspaces: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub max_depth: usize,
    pub concurrency: usize,
    pub yield_every: usize,
    /// Dot-directory names that are still descended into.
    pub allow_hidden: Vec<String>,
}

impl IndexOptions {
    /// Options from settings, allowing the pool root's directory through the dotfile filter.
    pub fn new(settings: &IndexSettings, pool_root: &Path) -> Self {
        let allow_hidden = pool_root
            .file_name()
            .map(|name| vec![name.to_string_lossy().to_string()])
            .unwrap_or_default();
        Self {
            max_depth: settings.max_depth,
            concurrency: settings.concurrency.max(1),
            yield_every: settings.yield_every.max(1),
            allow_hidden,
        }
    }
}

fn exclusion_set() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in EXCLUDED_PATTERNS {
        builder.add(Glob::new(pattern)?);
        builder.add(Glob::new(&format!("{}/**", pattern))?);
    }
    Ok(builder.build()?)
}

/// Finds runnable projects under `root`, in breadth-first order.
pub async fn index_projects(root: &Path, options: &IndexOptions) -> Result<Vec<Project>> {
    let root = tokio::fs::canonicalize(root)
        .await
        .with_context(|| format!("failed to resolve {}", root.display()))?;
    let excluded = Arc::new(exclusion_set()?);
    let allow = Arc::new(options.allow_hidden.clone());
    let concurrency = options.concurrency.max(1);
    let yield_every = options.yield_every.max(1);

    let mut projects = Vec::new();
    let mut level = vec![root.clone()];
    let mut depth = 0;
    let mut processed = 0usize;

    while !level.is_empty() {
        level.sort();
        let descend = depth < options.max_depth;
        let mut next = Vec::new();
        for chunk in level.chunks(concurrency) {
            let mut visits = JoinSet::new();
            for (slot, dir) in chunk.iter().enumerate() {
                let dir = dir.clone();
                let root = root.clone();
                let excluded = excluded.clone();
                let allow = allow.clone();
                visits.spawn_blocking(move || (slot, visit(&dir, &root, &excluded, &allow, descend)));
            }
            let mut results = vec![None; chunk.len()];
            while let Some(joined) = visits.join_next().await {
                match joined {
                    Ok((slot, visited)) => results[slot] = Some(visited),
                    Err(err) => tracing::debug!(error = %err, "index visit failed"),
                }
            }
            for (project, children) in results.into_iter().flatten() {
                projects.extend(project);
                next.extend(children);
                processed += 1;
                if processed % yield_every == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
        level = next;
        depth += 1;
    }
    tracing::debug!(root = %root.display(), found = projects.len(), visited = processed, "index complete");
    Ok(projects)
}

fn visit(
    dir: &Path,
    root: &Path,
    excluded: &GlobSet,
    allow_hidden: &[String],
    descend: bool,
) -> (Option<Project>, Vec<PathBuf>) {
    let project = read_project(dir, root, excluded);
    if !descend {
        return (project, Vec::new());
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (project, Vec::new());
    };
    let children = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if DENY_DIRS.contains(&name.as_str()) {
                return false;
            }
            !name.starts_with('.') || allow_hidden.contains(&name)
        })
        .map(|entry| entry.path())
        .collect();
    (project, children)
}

fn read_project(dir: &Path, root: &Path, excluded: &GlobSet) -> Option<Project> {
    let manifest = read_manifest(dir)?;
    let dev_script = manifest
        .get("scripts")
        .and_then(|s| s.get("dev"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    if excluded.is_match(relative) {
        return None;
    }
    let tags = detect_tags(dir, &manifest);
    if tags.is_empty() {
        return None;
    }
    let name = manifest
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| dir.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_default();
    let workspaces =
        manifest.get("workspaces").is_some() || dir.join("pnpm-workspace.yaml").is_file();
    Some(Project {
        path: dir.to_path_buf(),
        name,
        dev_script,
        package_manager: PackageManager::detect(dir),
        workspaces,
        tags,
    })
}

fn detect_tags(dir: &Path, manifest: &Value) -> Vec<String> {
    let mut tags = BTreeSet::new();
    for section in ["dependencies", "devDependencies"] {
        let Some(deps) = manifest.get(section).and_then(Value::as_object) else {
            continue;
        };
        for (package, tag) in DEPENDENCY_TAGS {
            if deps.contains_key(*package) {
                tags.insert(tag.to_string());
            }
        }
    }
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            for (prefix, tag) in CONFIG_TAGS {
                if name.starts_with(prefix) {
                    tags.insert(tag.to_string());
                }
            }
        }
    }
    tags.into_iter().collect()
}
