use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=.git/HEAD");

    set_env("BUILD_PROFILE", env_var("PROFILE"));
    set_env(
        "GIT_COMMIT",
        git_commit().unwrap_or_else(|| "unknown".to_string()),
    );
    set_env(
        "RUSTC_VERSION",
        rustc_version().unwrap_or_else(|| "unknown".to_string()),
    );
}

fn set_env(key: &str, value: String) {
    println!("cargo:rustc-env={key}={value}");
}

fn env_var(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| "unknown".to_string())
}

fn git_commit() -> Option<String> {
    command_output(&["git", "rev-parse", "--short=12", "HEAD"])
}

fn rustc_version() -> Option<String> {
    command_output(&["rustc", "--version"])
}

fn command_output(cmd: &[&str]) -> Option<String> {
    let (program, args) = cmd.split_first()?;

    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if text.is_empty() { None } else { Some(text) }
}
