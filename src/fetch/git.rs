//! Git sources pinned to a full commit hash.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;

use super::{resolve_location, Location};

pub(super) fn fetch_git(
    url: &str,
    commit: &str,
    tag: Option<&str>,
    recipe_dir: &Path,
    dest: &Path,
) -> Result<()> {
    let remote = match resolve_location(url, recipe_dir) {
        Ok(Location::Local(path)) => path.display().to_string(),
        Ok(Location::Remote(url)) => url,
        // ssh/git schemes are left to git itself.
        Err(_) => url.to_string(),
    };

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    run_git(
        parent,
        &["clone", "--quiet", "--no-checkout", &remote, &dest.display().to_string()],
    )?;
    run_git(dest, &["checkout", "--quiet", "--detach", commit])?;

    let head = run_git(dest, &["rev-parse", "HEAD"])?;
    if head != commit {
        bail!("checked out {} but the pinned commit is {}", head, commit);
    }

    if let Some(tag) = tag {
        let tagged = run_git(dest, &["rev-parse", &format!("refs/tags/{tag}^{{commit}}")])
            .with_context(|| format!("tag '{}' is not available from {}", tag, url))?;
        if tagged != commit {
            bail!(
                "tag '{}' resolves to {}, not the pinned commit {}",
                tag,
                tagged,
                commit
            );
        }
    }

    // The source tree is the checkout only; history never reaches a build.
    let git_dir = dest.join(".git");
    fs::remove_dir_all(&git_dir)
        .with_context(|| format!("Failed to remove {}", git_dir.display()))?;
    Ok(())
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .context("running git (is it installed?)")?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git(cwd: &Path, args: &[&str]) -> String {
        let mut full = vec!["-c", "user.name=obake", "-c", "user.email=obake@localhost"];
        full.extend_from_slice(args);
        run_git(cwd, &full).unwrap()
    }

    fn upstream(temp: &TempDir) -> (std::path::PathBuf, String) {
        let repo = temp.path().join("upstream");
        fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        fs::write(repo.join("Makefile"), "all:\n").unwrap();
        git(&repo, &["add", "Makefile"]);
        git(&repo, &["commit", "--quiet", "-m", "v1"]);
        git(&repo, &["tag", "v1.0"]);
        let commit = git(&repo, &["rev-parse", "HEAD"]);
        fs::write(repo.join("NEWS"), "later\n").unwrap();
        git(&repo, &["add", "NEWS"]);
        git(&repo, &["commit", "--quiet", "-m", "later"]);
        (repo, commit)
    }

    #[test]
    fn test_checkout_pinned_commit() {
        if which::which("git").is_err() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let (repo, commit) = upstream(&temp);
        let dest = temp.path().join("checkout");

        fetch_git("upstream", &commit, Some("v1.0"), temp.path(), &dest).unwrap();

        assert!(dest.join("Makefile").is_file());
        assert!(!dest.join("NEWS").exists());
        assert!(!dest.join(".git").exists());
        assert!(repo.join("NEWS").exists());
    }

    #[test]
    fn test_tag_must_match_commit() {
        if which::which("git").is_err() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let (repo, _) = upstream(&temp);
        let head = git(&repo, &["rev-parse", "HEAD"]);

        let err = fetch_git(
            &repo.display().to_string(),
            &head,
            Some("v1.0"),
            temp.path(),
            &temp.path().join("checkout"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not the pinned commit"));
    }
}
