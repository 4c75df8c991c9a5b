use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

/// Total bytes of the regular files under `folder`. Symlinks are not
/// followed and entries that cannot be read count as zero.
pub fn backup_size(folder: &Path) -> u64 {
    WalkDir::new(folder)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry while sizing backup");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.metadata().map(|m| m.len()).unwrap_or(0))
        .sum()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn sums_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.img"), vec![0u8; 100]).expect("write");
        fs::create_dir_all(dir.path().join("boot/firmware")).expect("mkdir");
        fs::write(dir.path().join("boot/cmdline.txt"), vec![0u8; 20]).expect("write");
        fs::write(dir.path().join("boot/firmware/start.elf"), vec![0u8; 3]).expect("write");

        assert_eq!(backup_size(dir.path()), 123);
    }

    #[test]
    fn empty_and_missing_folders_are_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(backup_size(dir.path()), 0);
        assert_eq!(backup_size(&dir.path().join("gone")), 0);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        fs::write(outside.path().join("big"), vec![0u8; 1000]).expect("write");
        fs::write(dir.path().join("small"), vec![0u8; 10]).expect("write");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).expect("symlink");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).expect("symlink");

        assert_eq!(backup_size(dir.path()), 10);
    }
}
