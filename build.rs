//! Stamps build metadata into the controller binary for the startup log.

use std::process::Command;

fn main() {
    let now = chrono::Utc::now();
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", now.timestamp());
    println!(
        "cargo:rustc-env=BUILD_DATETIME={}",
        now.format("%Y-%m-%d %H:%M:%S UTC")
    );

    // Command-line git keeps OpenSSL out of the build graph
    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_GIT_HASH={git_hash}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}
