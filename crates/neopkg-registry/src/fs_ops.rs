use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

pub(crate) fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Writes `content` next to `path` and renames it into place.
pub(crate) fn write_file_replacing(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let staged = parent.join(format!(".{file_name}.{}.tmp", unique_suffix()));
    let write_result = (|| -> Result<()> {
        let mut file = fs::File::create(&staged)
            .with_context(|| format!("failed creating {}", staged.display()))?;
        file.write_all(content)
            .with_context(|| format!("failed writing {}", staged.display()))?;
        file.sync_all()
            .with_context(|| format!("failed syncing {}", staged.display()))?;
        fs::rename(&staged, path).with_context(|| {
            format!(
                "failed replacing {} with {}",
                path.display(),
                staged.display()
            )
        })
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&staged);
    }
    write_result
}

pub(crate) fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(entries.next().is_none())
}
