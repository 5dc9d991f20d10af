//! Git checkouts.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::stage::Stage;
use super::{FetchContext, FetchError, FetchStrategy, with_retries};
use crate::process;

static GIT_VERSION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok());

/// First git release supporting `--single-branch` with `--depth`.
const SHALLOW_BRANCH_MIN: (u32, u32, u32) = (1, 7, 10);

/// What to check out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    /// A specific commit (full clone, then checkout).
    Commit(String),
    /// A tag.
    Tag(String),
    /// A branch.
    Branch(String),
    /// The remote's default branch.
    Default,
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit(c) => write!(f, "commit={c}"),
            Self::Tag(t) => write!(f, "tag={t}"),
            Self::Branch(b) => write!(f, "branch={b}"),
            Self::Default => f.write_str("default branch"),
        }
    }
}

/// Clone a git repository into the stage's source directory.
#[derive(Debug, Clone)]
pub struct GitFetch {
    url: String,
    reference: GitRef,
}

/// Parse `git --version` output into (major, minor, patch).
pub(crate) fn parse_git_version(output: &str) -> Option<(u32, u32, u32)> {
    let caps = GIT_VERSION.as_ref()?.captures(output)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok());
    Some((num(1)?, num(2)?, num(3).unwrap_or(0)))
}

fn git(dir: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd
}

impl GitFetch {
    /// Strategy cloning `url` at `reference`.
    pub fn new(url: String, reference: GitRef) -> Self {
        Self { url, reference }
    }

    /// Clone arguments for a git of version `git_version`.
    pub(crate) fn clone_args(&self, git_version: (u32, u32, u32), dest: &Path) -> Vec<String> {
        let mut args = vec!["clone".to_string(), "--quiet".to_string()];
        match &self.reference {
            GitRef::Tag(name) | GitRef::Branch(name) => {
                if git_version >= SHALLOW_BRANCH_MIN {
                    args.extend(["--depth".into(), "1".into(), "--single-branch".into()]);
                }
                args.extend(["--branch".into(), name.clone()]);
            }
            GitRef::Commit(_) | GitRef::Default => {}
        }
        args.push(self.url.clone());
        args.push(dest.display().to_string());
        args
    }

    async fn run_git(&self, mut cmd: Command, args: &[String], ctx: &FetchContext) -> Result<String, FetchError> {
        cmd.args(args);
        process::capture(cmd, &ctx.limits)
            .await
            .map_err(|e| FetchError::from_process(&self.url, e))
    }
}

#[async_trait]
impl FetchStrategy for GitFetch {
    fn source(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, stage: &Stage, ctx: &FetchContext) -> Result<(), FetchError> {
        let dest = stage.source_path();
        if dest.join(".git").exists() {
            tracing::debug!(path = %dest.display(), "checkout already present");
            return Ok(());
        }

        let version_text = self.run_git(git(None), &["--version".to_string()], ctx).await?;
        let version = parse_git_version(&version_text).ok_or_else(|| FetchError::FetchFailed {
            url: self.url.clone(),
            cause: format!("unrecognised git version: {}", version_text.trim()),
        })?;

        // Each attempt clones into a fresh scratch directory.
        let (_scratch, work) = with_retries(&self.url, ctx, move || async move {
            let scratch = stage.scratch(".clone-")?;
            let work = scratch.path().join("repo");
            self.run_git(git(Some(scratch.path())), &self.clone_args(version, &work), ctx)
                .await?;
            Ok::<_, FetchError>((scratch, work))
        })
        .await?;
        if let GitRef::Commit(commit) = &self.reference {
            let args = ["checkout".to_string(), "--quiet".to_string(), commit.clone()];
            self.run_git(git(Some(&work)), &args, ctx).await?;
        }

        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        tokio::fs::rename(&work, &dest).await?;
        tracing::info!(url = %self.url, reference = %self.reference, "cloned");
        Ok(())
    }

    async fn verify(&self, _stage: &Stage) -> Result<(), FetchError> {
        Ok(())
    }

    async fn expand(&self, _stage: &Stage) -> Result<(), FetchError> {
        Ok(())
    }

    async fn reset(&self, stage: &Stage, ctx: &FetchContext) -> Result<(), FetchError> {
        let dest = stage.source_path();
        if !dest.join(".git").exists() {
            return Err(FetchError::NoArchive(dest));
        }
        let reset = ["reset".to_string(), "--hard".to_string(), "--quiet".to_string()];
        self.run_git(git(Some(&dest)), &reset, ctx).await?;
        let clean = ["clean".to_string(), "--quiet".to_string(), "-ffdx".to_string()];
        self.run_git(git(Some(&dest)), &clean, ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(parse_git_version("git version 2.43.0\n"), Some((2, 43, 0)));
        assert_eq!(parse_git_version("git version 1.7.1"), Some((1, 7, 1)));
        assert_eq!(parse_git_version("git version 2.39.3 (Apple Git-145)"), Some((2, 39, 3)));
        assert_eq!(parse_git_version("not git"), None);
    }

    #[test]
    fn shallow_clone_only_on_new_git() {
        let f = GitFetch::new("https://example.org/r.git".into(), GitRef::Tag("v1.0".into()));
        let dest = Path::new("/stage/repo");
        let new = f.clone_args((2, 40, 0), dest);
        assert!(new.windows(2).any(|w| w == ["--depth", "1"]));
        assert!(new.contains(&"--single-branch".to_string()));

        let old = f.clone_args((1, 7, 1), dest);
        assert!(!old.contains(&"--depth".to_string()));
        assert!(old.windows(2).any(|w| w == ["--branch", "v1.0"]));

        let commit = GitFetch::new("u".into(), GitRef::Commit("abc123".into()));
        assert!(!commit.clone_args((2, 40, 0), dest).contains(&"--depth".to_string()));
    }

    fn sh(dir: &Path, script: &str) {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.org")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.org")
            .status()
            .unwrap();
        assert!(status.success(), "{script}");
    }

    #[tokio::test]
    async fn unreachable_remote_fails_after_retries() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-repo");
        let fetcher = GitFetch::new(format!("file://{}", missing.display()), GitRef::Default);
        let stage = Stage::new(dir.path().join("stage"));
        let ctx = FetchContext {
            retries: 1,
            ..FetchContext::default()
        };
        let err = fetcher.fetch(&stage, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), "FetchFailed");
        assert!(!stage.source_path().exists());
        let leftovers: Vec<_> = std::fs::read_dir(stage.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "scratch clones were left behind");
    }

    #[tokio::test]
    async fn clone_tag_and_reset() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        sh(
            &origin,
            "git init -q && echo one > f.txt && git add f.txt && git commit -qm one && git tag v1 \
             && echo two > f.txt && git commit -qam two",
        );

        let fetcher = GitFetch::new(format!("file://{}", origin.display()), GitRef::Tag("v1".into()));
        let stage = Stage::new(dir.path().join("stage"));
        let ctx = FetchContext::default();
        fetcher.fetch(&stage, &ctx).await.unwrap();
        let file = stage.source_path().join("f.txt");
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "one\n");

        std::fs::write(&file, "dirty\n").unwrap();
        std::fs::write(stage.source_path().join("untracked.o"), "x").unwrap();
        fetcher.reset(&stage, &ctx).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "one\n");
        assert!(!stage.source_path().join("untracked.o").exists());
    }
}
