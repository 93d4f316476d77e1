use std::path::Path;
use std::process::Command;

use chrono::{TimeZone, Utc};
use git2::{Oid, Repository};
use log::debug;

use crate::error::{Error, Result};
use crate::models::Commit;

/// Outcome of resolving a repository argument against the local filesystem.
pub enum Inspection {
    /// The path holds a git worktree and the revision resolved.
    Resolved { origin: String, commit: Commit },
    /// The path holds a git worktree but the revision did not resolve.
    UnknownReference { origin: String },
    /// The path does not exist: the argument is a repository URL.
    NotLocal,
}

/// Inspect `path` as a local git repository and resolve `rev` to a commit.
///
/// A non-existent path is not an error: it means the argument refers to an
/// online repository and must be resolved by a source provider. Bailing out
/// early also keeps the upward `.git` discovery from wandering off when the
/// user passed a URL like `github.com/owner/repo` from inside another
/// repository.
pub fn inspect(path: &str, rev: &str) -> Result<Inspection> {
    if !Path::new(path).exists() {
        return Ok(Inspection::NotLocal);
    }

    let repo = Repository::discover(path)?;

    let remote = repo.find_remote("origin")?;
    let origin = remote
        .url()
        .ok_or_else(|| {
            Error::Repository(format!("remote 'origin' of {path:?} has no associated URL"))
        })?
        .to_owned();

    let head = repo.head()?;

    let oid = if rev == "HEAD" {
        match head.target() {
            Some(oid) => oid,
            None => return Ok(Inspection::UnknownReference { origin }),
        }
    } else {
        match repo.revparse_single(rev).and_then(|obj| obj.peel_to_commit()) {
            Ok(commit) => commit.id(),
            Err(_) => {
                // Libgit2 occasionally fails to resolve revisions the git
                // binary accepts (in particular some abbreviated SHAs), so
                // fall back to shelling out before giving up.
                match resolve_with_git_binary(path, rev) {
                    Some(oid) => oid,
                    None => return Ok(Inspection::UnknownReference { origin }),
                }
            }
        }
    };

    let commit = match repo.find_commit(oid) {
        Ok(commit) => commit,
        Err(_) => return Ok(Inspection::UnknownReference { origin }),
    };

    let author = commit.author();
    let mut result = Commit {
        sha: commit.id().to_string(),
        author: match (author.name(), author.email()) {
            (Some(name), Some(email)) => format!("{name} <{email}>"),
            (Some(name), None) => name.to_owned(),
            _ => String::new(),
        },
        date: Utc.timestamp_opt(author.when().seconds(), 0).single(),
        message: commit.message().unwrap_or_default().to_owned(),
        head: head.shorthand().map(str::to_owned),
        ..Commit::default()
    };

    // Collect the references pointing at this commit.
    for reference in repo.references()?.flatten() {
        if reference.target() != Some(commit.id()) {
            continue;
        }
        let Some(short) = reference.shorthand() else {
            continue;
        };
        if reference.is_tag() {
            result.tags.push(short.to_owned());
        } else if reference.is_branch() || reference.is_remote() {
            result.branches.push(short.to_owned());
        }
    }

    debug!("resolved {rev:?} to {} in {path:?}", result.sha);
    Ok(Inspection::Resolved {
        origin,
        commit: result,
    })
}

// `git show` resolves anything commit-ish, including abbreviated SHAs.
fn resolve_with_git_binary(path: &str, rev: &str) -> Option<Oid> {
    let output = Command::new("git")
        .arg("-C")
        .arg(path)
        .args(["show", rev, "--pretty=format:%H", "--no-patch"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Oid::from_str(stdout.lines().next()?.trim()).ok()
}
