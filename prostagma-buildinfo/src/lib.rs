//! Git metadata shared by the prostagma binaries.
//!
//! Build scripts call [`emit_git_metadata`], which exports
//! `PROSTAGMA_BUILD_GIT_{TAG,COMMIT,DIRTY}` to the crate being compiled; the
//! binaries read those back with `option_env!` and hand them to
//! [`version_text`].

use std::{env, process::Command};

const GIT_TAG_KEY: &str = "PROSTAGMA_BUILD_GIT_TAG";
const GIT_COMMIT_KEY: &str = "PROSTAGMA_BUILD_GIT_COMMIT";
const GIT_DIRTY_KEY: &str = "PROSTAGMA_BUILD_GIT_DIRTY";

/// Prints the `cargo:` directives for the current build. Values already set in
/// the environment win over what git reports.
pub fn emit_git_metadata() {
    for key in [GIT_TAG_KEY, GIT_COMMIT_KEY, GIT_DIRTY_KEY] {
        println!("cargo:rerun-if-env-changed={key}");
    }

    let git_tag = env::var(GIT_TAG_KEY).unwrap_or_else(|_| {
        run_git(&["describe", "--tags", "--exact-match"]).unwrap_or_else(|| "untagged".to_string())
    });
    let git_commit = env::var(GIT_COMMIT_KEY).unwrap_or_else(|_| {
        run_git(&["rev-parse", "--short=12", "HEAD"]).unwrap_or_else(|| "unknown".to_string())
    });
    let git_dirty = env::var(GIT_DIRTY_KEY).unwrap_or_else(|_| {
        let status = run_git(&["status", "--porcelain", "--untracked-files=no"]);
        status.is_some_and(|output| !output.is_empty()).to_string()
    });

    println!("cargo:rustc-env={GIT_TAG_KEY}={git_tag}");
    println!("cargo:rustc-env={GIT_COMMIT_KEY}={git_commit}");
    println!("cargo:rustc-env={GIT_DIRTY_KEY}={git_dirty}");
}

/// One-line version banner; the commit is only shown for dirty trees.
pub fn version_text(
    binary: &str,
    git_tag: Option<&str>,
    git_commit: Option<&str>,
    git_dirty: Option<&str>,
) -> String {
    let git_tag = git_tag.unwrap_or("untagged");
    let git_commit = git_commit.unwrap_or("unknown");
    let dirty = matches!(git_dirty, Some("true" | "1" | "yes" | "dirty"));

    if dirty {
        format!("{binary} {git_tag} (dirty commit: {git_commit})")
    } else {
        format!("{binary} {git_tag}")
    }
}

fn run_git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|value| value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_build_shows_only_the_tag() {
        assert_eq!(
            version_text("prostagma-agent", Some("v1.2.0"), Some("abc123"), Some("false")),
            "prostagma-agent v1.2.0"
        );
    }

    #[test]
    fn dirty_build_shows_the_commit() {
        assert_eq!(
            version_text("prostagma-coordinator", None, Some("abc123"), Some("true")),
            "prostagma-coordinator untagged (dirty commit: abc123)"
        );
    }

    #[test]
    fn missing_metadata_falls_back_to_placeholders() {
        assert_eq!(version_text("bin", None, None, None), "bin untagged");
    }
}
