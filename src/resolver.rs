//! Dev command resolution.
//!
//! Turns a project's `scripts.dev` into a directly executable program so a dev server
//! can be spawned without a package manager shim on PATH.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

const WRAPPERS: &[&str] = &["pnpm", "npm", "yarn", "npx"];

/// Package manager inferred from lockfiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Pnpm,
    Yarn,
    Npm,
    Bun,
    Unknown,
}

impl PackageManager {
    /// Detects the package manager from lockfiles, in precedence order.
    pub fn detect(dir: &Path) -> Self {
        const LOCKFILES: &[(&str, PackageManager)] = &[
            ("pnpm-lock.yaml", PackageManager::Pnpm),
            ("yarn.lock", PackageManager::Yarn),
            ("package-lock.json", PackageManager::Npm),
            ("bun.lockb", PackageManager::Bun),
            ("bun.lock", PackageManager::Bun),
        ];
        LOCKFILES
            .iter()
            .find(|(file, _)| dir.join(file).is_file())
            .map(|(_, pm)| *pm)
            .unwrap_or(PackageManager::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Npm => "npm",
            PackageManager::Bun => "bun",
            PackageManager::Unknown => "unknown",
        }
    }
}

/// Result of resolving a project's dev command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DevCommand {
    /// A binary that can be executed directly.
    Bin { cmd: PathBuf, args: Vec<String> },
    /// `<package manager> run dev`.
    Fallback { cmd: String, args: Vec<String> },
}

impl DevCommand {
    fn fallback(package_manager: &str) -> Self {
        DevCommand::Fallback {
            cmd: package_manager.to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
        }
    }
}

/// Resolves the dev command for `dir`.
///
/// `default_pm` is used for the fallback when no lockfile identifies the package manager.
pub fn resolve_dev_command(dir: &Path, default_pm: &str) -> DevCommand {
    let pm = match PackageManager::detect(dir) {
        PackageManager::Unknown => default_pm.to_string(),
        pm => pm.as_str().to_string(),
    };
    let Some(manifest) = read_manifest(dir) else {
        return DevCommand::fallback(&pm);
    };
    let scripts = manifest.get("scripts");
    let Some(dev) = scripts.and_then(|s| s.get("dev")).and_then(Value::as_str) else {
        return DevCommand::fallback(&pm);
    };

    match resolve_tokens(dir, tokenize(dev), scripts) {
        Some((cmd, args)) => DevCommand::Bin { cmd, args },
        None => DevCommand::fallback(&pm),
    }
}

fn resolve_tokens(
    dir: &Path,
    mut tokens: Vec<String>,
    scripts: Option<&Value>,
) -> Option<(PathBuf, Vec<String>)> {
    let first = tokens.first()?.clone();
    if WRAPPERS.contains(&first.as_str()) {
        let is_run = tokens.get(1).map(String::as_str) == Some("run");
        let target = tokens
            .get(2)
            .and_then(|name| scripts?.get(name.as_str()))
            .and_then(Value::as_str);
        if is_run && tokens.len() >= 3 {
            // One level of indirection only; whatever the target says is used as-is.
            let target = target?;
            let mut substituted = tokenize(target);
            substituted.extend(tokens.drain(3..));
            tokens = substituted;
        } else if first == "npx" {
            tokens.remove(0);
        } else {
            return None;
        }
    }

    let program = tokens.first()?.clone();
    let args = tokens[1..].to_vec();
    let path = locate_program(dir, &program)?;
    Some((path, args))
}

fn locate_program(dir: &Path, program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    let has_separator = program.contains('/') || program.contains(std::path::MAIN_SEPARATOR);
    let path = if candidate.is_absolute() || has_separator {
        dir.join(candidate)
    } else {
        dir.join("node_modules").join(".bin").join(program)
    };
    path.exists().then_some(path)
}

fn tokenize(script: &str) -> Vec<String> {
    shell_words::split(script)
        .unwrap_or_else(|_| script.split_whitespace().map(str::to_string).collect())
}

/// Reads and parses `package.json`; None when missing or malformed.
pub fn read_manifest(dir: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(dir.join("package.json")).ok()?;
    serde_json::from_str(&raw).ok()
}
