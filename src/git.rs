//! Source acquisition from git remotes and version tag ordering

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Tag given to the first version of an application
pub const INITIAL_TAG: &str = "v1.0.0";

async fn run_git(args: &[&str]) -> Result<String> {
    debug!("Running: git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Reject repository URLs and branch names git would read as options
pub fn validate_source(repo_url: &str, branch: &str) -> Result<()> {
    if repo_url.trim().is_empty() {
        return Err(Error::InvalidInput("repository URL is required".into()));
    }
    if repo_url.starts_with('-') {
        return Err(Error::InvalidInput(format!("invalid repository URL '{}'", repo_url)));
    }
    if branch.is_empty() || branch.starts_with('-') {
        return Err(Error::InvalidInput(format!("invalid branch '{}'", branch)));
    }
    Ok(())
}

/// Tag names advertised by a remote, in the order the remote lists them
pub async fn list_remote_tags(repo_url: &str) -> Result<Vec<String>> {
    let stdout = run_git(&["ls-remote", "--tags", "--refs", "--", repo_url]).await?;
    Ok(stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|refname| refname.strip_prefix("refs/tags/"))
        .map(str::to_string)
        .collect())
}

/// Shallow, single-branch clone of `branch` into `dest`
pub async fn clone_branch(repo_url: &str, branch: &str, dest: &Path) -> Result<()> {
    let dest = dest
        .to_str()
        .ok_or_else(|| Error::InvalidInput(format!("non UTF-8 path {}", dest.display())))?;
    run_git(&[
        "clone",
        "--depth",
        "1",
        "--single-branch",
        "--branch",
        branch,
        "--",
        repo_url,
        dest,
    ])
    .await?;
    info!(repo = repo_url, branch, dest, "Cloned repository");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct SemVer<'a> {
    major: u64,
    minor: u64,
    patch: u64,
    pre: Option<&'a str>,
}

fn parse_semver(tag: &str) -> Option<SemVer<'_>> {
    let version = tag.strip_prefix('v').unwrap_or(tag);
    let version = version.split('+').next().unwrap_or(version);
    let (core, pre) = match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    };

    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(SemVer {
        major,
        minor,
        patch,
        pre,
    })
}

fn compare_pre(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Total order over version tags
///
/// `v?MAJOR.MINOR.PATCH[-pre]` tags compare numerically with pre-releases
/// below their release. Anything else sorts below every semver tag and
/// lexicographically among itself.
pub fn compare_tags(a: &str, b: &str) -> Ordering {
    match (parse_semver(a), parse_semver(b)) {
        (Some(x), Some(y)) => (x.major, x.minor, x.patch)
            .cmp(&(y.major, y.minor, y.patch))
            .then_with(|| match (x.pre, y.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(p), Some(q)) => compare_pre(p, q),
            })
            .then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Highest tag under [`compare_tags`]
pub fn latest_tag<S: AsRef<str>>(tags: &[S]) -> Option<&str> {
    tags.iter()
        .map(|t| t.as_ref())
        .max_by(|a, b| compare_tags(a, b))
}

/// Tag for a new upload: [`INITIAL_TAG`] first, then the highest semver tag
/// with its patch bumped
pub fn next_patch_tag<S: AsRef<str>>(existing: &[S]) -> String {
    existing
        .iter()
        .filter_map(|t| parse_semver(t.as_ref()).map(|v| (t.as_ref(), v)))
        .max_by(|(a, _), (b, _)| compare_tags(a, b))
        .map(|(_, v)| format!("v{}.{}.{}", v.major, v.minor, v.patch + 1))
        .unwrap_or_else(|| INITIAL_TAG.to_string())
}
