//! Build-time version info, stamped by build.rs.

/// Release version string.
pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash, or "unknown" outside a checkout.
pub fn git_commit() -> &'static str {
    option_env!("GIT_COMMIT").unwrap_or("unknown")
}

/// Full version string with platform info, as reported by `Version`.
pub fn full() -> String {
    format!(
        "{} (commit: {}, {}/{})",
        RELEASE,
        git_commit(),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}
