use std::path::{Path, PathBuf};

/// Get the base directory for ccmux data (the project root)
#[must_use]
pub fn base_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Get the directory holding the session database
#[must_use]
pub fn data_dir() -> PathBuf {
    base_dir().join("data")
}

/// Get the path to the SQLite session database
#[must_use]
pub fn database_path() -> PathBuf {
    data_dir().join("sessions.db")
}

/// Get the directory for log files
#[must_use]
pub fn logs_dir() -> PathBuf {
    base_dir().join("logs")
}

/// Create `data/` and `logs/` with mode 0755 if they are missing
pub fn ensure_dirs() -> std::io::Result<()> {
    for dir in [data_dir(), logs_dir()] {
        create_dir_0755(&dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new()
        .mode(0o755)
        .recursive(true)
        .create(dir)
    {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_path_is_under_data() {
        assert!(database_path().starts_with(data_dir()));
        assert!(database_path().ends_with("sessions.db"));
    }
}
