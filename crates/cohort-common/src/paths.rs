use std::path::{Path, PathBuf};

/// Root data directory for a cohort node.
///
/// All cohort state is machine-local (node keys, enrollment artifacts,
/// hub registry). None of it should roam across machines.
///
/// - Linux: `~/.cohort/`
/// - macOS: `~/Library/Application Support/cohort/`
/// - Windows: `%LOCALAPPDATA%\cohort\`
pub fn cohort_data_dir() -> PathBuf {
    if let Some(existing) = std::env::var_os("COHORT_DATA_DIR") {
        return PathBuf::from(existing);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("cohort");
        }
    }

    #[cfg(windows)]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("cohort");
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".cohort");
        }
    }

    // Fallback
    PathBuf::from(".cohort")
}

/// Directory holding the node's enrollment artifacts.
pub fn enrollment_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("enrollment")
}

/// Directory holding hub-side registry state.
pub fn hub_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("hub")
}

/// Directory for cached certificate mirrors.
pub fn certs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("certs")
}
