use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use walkdir::WalkDir;

use super::staging::StagedOutput;
use super::{Chunk, ChunkCopy};
use crate::errors::TransferFailure;

struct TreeEntry {
    rel: PathBuf,
    is_dir: bool,
}

struct OpenFile {
    reader: File,
    writer: File,
    target: PathBuf,
    mtime: Option<FileTime>,
}

/// Copies a directory tree into a staged copy of `dst`, one file at a time.
pub(crate) struct DirSession {
    src_root: PathBuf,
    pending: VecDeque<TreeEntry>,
    current: Option<OpenFile>,
    files_done: usize,
    staging: StagedOutput,
}

impl DirSession {
    pub(crate) fn open(src: &Path, dst: &Path) -> Result<Self, TransferFailure> {
        let mut pending = VecDeque::new();
        for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|err| TransferFailure::on_source(io::Error::from(err)))?;
            let file_type = entry.file_type();
            if !file_type.is_dir() && !file_type.is_file() {
                log::debug!("skipping special entry {}", entry.path().display());
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|err| {
                    TransferFailure::on_source(io::Error::new(io::ErrorKind::InvalidInput, err))
                })?
                .to_path_buf();
            pending.push_back(TreeEntry {
                rel,
                is_dir: file_type.is_dir(),
            });
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(TransferFailure::on_destination)?;
        }
        let staging = StagedOutput::new(dst);
        fs::create_dir_all(staging.path()).map_err(TransferFailure::on_destination)?;

        Ok(Self {
            src_root: src.to_path_buf(),
            pending,
            current: None,
            files_done: 0,
            staging,
        })
    }

    fn open_next(&mut self, entry: TreeEntry) -> Result<(), TransferFailure> {
        let target = self.staging.path().join(&entry.rel);
        if entry.is_dir {
            return fs::create_dir_all(&target).map_err(TransferFailure::on_destination);
        }

        let reader =
            File::open(self.src_root.join(&entry.rel)).map_err(TransferFailure::on_source)?;
        let mtime = reader
            .metadata()
            .ok()
            .map(|meta| FileTime::from_last_modification_time(&meta));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(TransferFailure::on_destination)?;
        }
        let writer = File::create(&target).map_err(TransferFailure::on_destination)?;
        self.current = Some(OpenFile {
            reader,
            writer,
            target,
            mtime,
        });
        Ok(())
    }
}

impl ChunkCopy for DirSession {
    fn copy_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk, TransferFailure> {
        loop {
            if let Some(open) = self.current.as_mut() {
                let n = open.reader.read(buf).map_err(TransferFailure::on_source)?;
                if n > 0 {
                    open.writer
                        .write_all(&buf[..n])
                        .map_err(TransferFailure::on_destination)?;
                    return Ok(Chunk::Copied(n as u64));
                }

                open.writer.flush().map_err(TransferFailure::on_destination)?;
                if let Some(done) = self.current.take() {
                    drop(done.writer);
                    if let Some(mtime) = done.mtime {
                        if filetime::set_file_mtime(&done.target, mtime).is_err() {
                            log::debug!("could not preserve mtime for {}", done.target.display());
                        }
                    }
                }
                self.files_done += 1;
                return Ok(Chunk::Copied(0));
            }

            match self.pending.pop_front() {
                Some(entry) => self.open_next(entry)?,
                None => return Ok(Chunk::Complete),
            }
        }
    }

    fn commit(self: Box<Self>) -> Result<(), TransferFailure> {
        log::debug!(
            "committing {} file(s) into {}",
            self.files_done,
            self.staging.final_path().display()
        );
        let session = *self;
        session
            .staging
            .commit()
            .map_err(TransferFailure::on_destination)
    }
}
