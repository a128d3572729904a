use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix for output that is still being written.
pub const PARTIAL_SUFFIX: &str = ".mlc.partial";

/// Staged output for one transfer.
/// Deletes the staged file or tree on drop unless `commit()` is called.
pub(crate) struct StagedOutput {
    staged: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl StagedOutput {
    pub(crate) fn new(final_path: &Path) -> Self {
        Self {
            staged: staged_path_for(final_path),
            final_path: final_path.to_path_buf(),
            committed: false,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.staged
    }

    pub(crate) fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Rename the staged output onto its final path. A regular file already
    /// at the final path is replaced; an existing directory is not.
    pub(crate) fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.staged, &self.final_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let removed = match fs::symlink_metadata(&self.staged) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&self.staged),
            Ok(_) => fs::remove_file(&self.staged),
            Err(_) => return,
        };
        if let Err(err) = removed {
            log::debug!("could not remove staged {}: {err}", self.staged.display());
        }
    }
}

fn staged_path_for(dst: &Path) -> PathBuf {
    let mut staged: OsString = dst.as_os_str().to_owned();
    staged.push(PARTIAL_SUFFIX);
    PathBuf::from(staged)
}
