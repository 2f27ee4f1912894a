use std::sync::LazyLock;

/// Git commit the binary was built from, if the build ran inside a work tree.
pub const COMMIT_SHA: Option<&str> = option_env!("VERGEN_GIT_SHA");

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        COMMIT_SHA.unwrap_or("unknown"),
        if is_dirty() { "-dirty" } else { "" }
    )
});

fn is_dirty() -> bool {
    matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true"))
}
