use std::process::Command;

fn main() {
    // Release builds from a source tarball pass the revision in explicitly.
    println!("cargo:rerun-if-env-changed=WINPERFD_REVISION");
    if let Ok(revision) = std::env::var("WINPERFD_REVISION")
        && !revision.trim().is_empty()
    {
        println!("cargo:rustc-env=GIT_SHA={}", revision.trim());
        return;
    }

    let sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=GIT_SHA={sha}");

    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/");
}
