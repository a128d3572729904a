use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use filetime::FileTime;

use super::staging::StagedOutput;
use super::{Chunk, ChunkCopy};
use crate::errors::TransferFailure;

/// Streams one file into a staged copy of `dst`.
pub(crate) struct FileSession {
    reader: File,
    writer: File,
    mtime: Option<FileTime>,
    staging: StagedOutput,
}

impl FileSession {
    pub(crate) fn open(src: &Path, dst: &Path) -> Result<Self, TransferFailure> {
        let reader = File::open(src).map_err(TransferFailure::on_source)?;
        let mtime = reader
            .metadata()
            .ok()
            .map(|meta| FileTime::from_last_modification_time(&meta));

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(TransferFailure::on_destination)?;
        }
        let staging = StagedOutput::new(dst);
        let writer = File::create(staging.path()).map_err(TransferFailure::on_destination)?;

        Ok(Self {
            reader,
            writer,
            mtime,
            staging,
        })
    }
}

impl ChunkCopy for FileSession {
    fn copy_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk, TransferFailure> {
        let n = self.reader.read(buf).map_err(TransferFailure::on_source)?;
        if n == 0 {
            self.writer.flush().map_err(TransferFailure::on_destination)?;
            return Ok(Chunk::Complete);
        }
        self.writer
            .write_all(&buf[..n])
            .map_err(TransferFailure::on_destination)?;
        Ok(Chunk::Copied(n as u64))
    }

    fn commit(self: Box<Self>) -> Result<(), TransferFailure> {
        let session = *self;
        session
            .writer
            .sync_all()
            .map_err(TransferFailure::on_destination)?;
        drop(session.writer);
        if let Some(mtime) = session.mtime {
            if filetime::set_file_mtime(session.staging.path(), mtime).is_err() {
                log::debug!(
                    "could not preserve mtime for {}",
                    session.staging.final_path().display()
                );
            }
        }
        session
            .staging
            .commit()
            .map_err(TransferFailure::on_destination)
    }
}

/// Writes an in-memory buffer into a staged copy of `dst`.
pub(crate) struct BufferSession {
    data: Arc<[u8]>,
    offset: usize,
    writer: File,
    staging: StagedOutput,
}

impl BufferSession {
    pub(crate) fn open(data: Arc<[u8]>, dst: &Path) -> Result<Self, TransferFailure> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(TransferFailure::on_destination)?;
        }
        let staging = StagedOutput::new(dst);
        let writer = File::create(staging.path()).map_err(TransferFailure::on_destination)?;
        Ok(Self {
            data,
            offset: 0,
            writer,
            staging,
        })
    }
}

impl ChunkCopy for BufferSession {
    fn copy_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk, TransferFailure> {
        let remaining = &self.data[self.offset..];
        if remaining.is_empty() {
            return Ok(Chunk::Complete);
        }
        let n = remaining.len().min(buf.len());
        self.writer
            .write_all(&remaining[..n])
            .map_err(TransferFailure::on_destination)?;
        self.offset += n;
        Ok(Chunk::Copied(n as u64))
    }

    fn commit(self: Box<Self>) -> Result<(), TransferFailure> {
        let session = *self;
        session
            .writer
            .sync_all()
            .map_err(TransferFailure::on_destination)?;
        drop(session.writer);
        session
            .staging
            .commit()
            .map_err(TransferFailure::on_destination)
    }
}
