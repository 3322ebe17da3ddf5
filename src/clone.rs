//! Directory cloning for pool entries, copy-on-write where the filesystem allows it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// `cp -c -R` (APFS clonefile).
    CloneFlag,
    /// `cp -R --reflink=auto` (btrfs/xfs reflinks, plain copy otherwise).
    Reflink,
    /// In-process recursive copy.
    Recursive,
}

impl CopyStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CopyStrategy::CloneFlag => "cp -c",
            CopyStrategy::Reflink => "cp --reflink",
            CopyStrategy::Recursive => "recursive",
        }
    }
}

/// Clones `src` to `dst` (which must not exist yet), trying each strategy in turn.
pub async fn clone_dir(src: &Path, dst: &Path) -> Result<CopyStrategy> {
    if !src.is_dir() {
        bail!("clone source {} is not a directory", src.display());
    }
    if dst.exists() {
        bail!("clone destination {} already exists", dst.display());
    }

    let attempts: [(CopyStrategy, &[&str]); 2] = [
        (CopyStrategy::CloneFlag, &["-c", "-R"]),
        (CopyStrategy::Reflink, &["-R", "--reflink=auto"]),
    ];
    for (strategy, flags) in attempts {
        match run_cp(flags, src, dst).await {
            Ok(()) => {
                tracing::debug!(strategy = strategy.as_str(), dst = %dst.display(), "cloned");
                return Ok(strategy);
            }
            Err(err) => {
                tracing::debug!(strategy = strategy.as_str(), error = %err, "copy strategy failed");
                let _ = tokio::fs::remove_dir_all(dst).await;
            }
        }
    }

    let (from, to) = (src.to_path_buf(), dst.to_path_buf());
    let copied = tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
        .await
        .context("recursive copy task failed")?;
    if let Err(err) = copied {
        let _ = tokio::fs::remove_dir_all(dst).await;
        return Err(err);
    }
    tracing::debug!(strategy = "recursive", dst = %dst.display(), "cloned");
    Ok(CopyStrategy::Recursive)
}

async fn run_cp(flags: &[&str], src: &Path, dst: &Path) -> Result<()> {
    let status = Command::new("cp")
        .args(flags)
        .arg(src)
        .arg(dst)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("failed to run cp")?;
    if !status.success() {
        bail!("cp exited {}", status.code().unwrap_or(1));
    }
    Ok(())
}

/// Copies a tree, recreating symlinks as links and keeping file permissions.
pub fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .context("walked outside the copy source")?;
        let target: PathBuf = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            let permissions = entry.metadata()?.permissions();
            std::fs::set_permissions(&target, permissions)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            symlink(&link, &target)
                .with_context(|| format!("failed to link {}", target.display()))?;
        } else {
            // fs::copy carries permission bits over.
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(link, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("template");
        fs::create_dir_all(src.join("src/components")).unwrap();
        fs::write(src.join("package.json"), "{\"name\":\"template\"}").unwrap();
        fs::write(src.join("src/components/App.tsx"), "export {}").unwrap();
        dir
    }

    #[tokio::test]
    async fn clones_tree_with_some_strategy() {
        let dir = fixture();
        let src = dir.path().join("template");
        let dst = dir.path().join("inst-1");
        clone_dir(&src, &dst).await.unwrap();
        assert_eq!(
            fs::read_to_string(dst.join("src/components/App.tsx")).unwrap(),
            "export {}"
        );
        assert!(dst.join("package.json").is_file());
    }

    #[tokio::test]
    async fn refuses_existing_destination() {
        let dir = fixture();
        let src = dir.path().join("template");
        let dst = dir.path().join("taken");
        fs::create_dir_all(&dst).unwrap();
        assert!(clone_dir(&src, &dst).await.is_err());
        assert!(clone_dir(&dir.path().join("missing"), &dir.path().join("x"))
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn recursive_copy_keeps_symlinks_and_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = fixture();
        let src = dir.path().join("template");
        let script = src.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("package.json", src.join("manifest")).unwrap();

        let dst = dir.path().join("copy");
        copy_recursive(&src, &dst).unwrap();

        let mode = fs::metadata(dst.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let link = fs::symlink_metadata(dst.join("manifest")).unwrap();
        assert!(link.file_type().is_symlink());
        assert_eq!(fs::read_link(dst.join("manifest")).unwrap(), PathBuf::from("package.json"));
        assert!(dst.join("src/components/App.tsx").is_file());
    }
}
