// SPDX-License-Identifier: MPL-2.0

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=PITV_VERSION");

    // Packagers pin the version explicitly
    let version = std::env::var("PITV_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(version_from_git);

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// `<crate version>` outside a checkout, `<crate version>+<short hash>` inside
/// one, and `<tag>-<n>-g<hash>` as reported by git after a release tag
fn version_from_git() -> String {
    let package = env!("CARGO_PKG_VERSION");

    if let Some(described) = git(&["describe", "--tags", "--match", "v*"]) {
        let described = described.strip_prefix('v').unwrap_or(&described);
        return described.to_string();
    }

    match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) => format!("{package}+{hash}"),
        None => package.to_string(),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
