use std::path::{Path, PathBuf};

pub const SESSION_FILE: &str = "session.json";
pub const MESSAGES_FILE: &str = "messages.jsonl";
pub const COOKIES_FILE: &str = "cookies.json";

/// File locations of the three persisted stores under one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub session: PathBuf,
    pub messages: PathBuf,
    pub cookies: PathBuf,
}

#[must_use]
pub fn store_paths(data_dir: &Path) -> StorePaths {
    StorePaths {
        session: data_dir.join(SESSION_FILE),
        messages: data_dir.join(MESSAGES_FILE),
        cookies: data_dir.join(COOKIES_FILE),
    }
}

#[must_use]
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
