use std::path::{Path, PathBuf};

use crate::error::CrmError;

/// Application data directory (~/.medrep).
pub fn medrep_dir() -> Result<PathBuf, CrmError> {
    let home = dirs::home_dir()
        .ok_or_else(|| CrmError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".medrep"))
}

/// Write `content` to `path` via a sibling temp file and rename, creating the
/// parent directory if needed. Readers never observe a half-written file.
pub fn atomic_write_str(path: &Path, content: &str) -> Result<(), CrmError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CrmError::Io(format!("Invalid file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
