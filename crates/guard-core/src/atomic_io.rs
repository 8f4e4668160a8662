use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crate::clock::current_unix_timestamp_ms;

static TEMP_NONCE: AtomicU64 = AtomicU64::new(1);

/// Writes text durably using a synced temp file + rename so readers never
/// observe partial data, even across processes sharing the directory.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = parent_dir_of(path);
    std::fs::create_dir_all(&parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_path = parent_dir.join(format!(
        ".{}.tmp-{}-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("state"),
        std::process::id(),
        current_unix_timestamp_ms(),
        TEMP_NONCE.fetch_add(1, Ordering::Relaxed)
    ));

    let write_result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&temp_path)
            .with_context(|| format!("failed to create temporary file {}", temp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temporary file {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "failed to rename temporary file {} to {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    write_result
}

pub(crate) fn parent_dir_of(path: &Path) -> PathBuf {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::write_text_atomic;

    #[test]
    fn unit_write_text_atomic_replaces_content_and_leaves_no_temp_files() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested").join("record.json");
        write_text_atomic(&path, "{\"v\":1}").expect("first write");
        write_text_atomic(&path, "{\"v\":2}").expect("second write");
        assert_eq!(read_to_string(&path).expect("read"), "{\"v\":2}");

        let leftovers = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn regression_write_text_atomic_rejects_directory_destination() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let error = write_text_atomic(tempdir.path(), "x").expect_err("directory must fail");
        assert!(error.to_string().contains("is a directory"));
    }
}
