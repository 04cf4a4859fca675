//! Wrapper guards around the `fs2` crate.
//!
//! First move your file handle into a `LockableFile` via
//! `From`/`Into`. Then call locking methods on that to get a guard
//! with access to the file handle.

use std::{fs::File, ops::Deref, path::Path};

use fs2::{lock_contended_error, FileExt};

pub struct SharedFileLock<'s, F: FileExt> {
    file: &'s F,
}

impl<'s, F: FileExt> Drop for SharedFileLock<'s, F> {
    fn drop(&mut self) {
        self.file
            .unlock()
            .expect("no way another path to unlock exists");
    }
}

impl<'s, F: FileExt> Deref for SharedFileLock<'s, F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        self.file
    }
}

#[derive(Debug)]
pub struct ExclusiveFileLock<'s, F: FileExt> {
    file: &'s F,
}

impl<'s, F: FileExt> Drop for ExclusiveFileLock<'s, F> {
    fn drop(&mut self) {
        self.file
            .unlock()
            .expect("no way another path to unlock exists");
    }
}

impl<'s, F: FileExt> Deref for ExclusiveFileLock<'s, F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        self.file
    }
}

#[derive(Debug)]
pub struct LockableFile<F: FileExt> {
    file: F,
}

impl<F: FileExt> From<F> for LockableFile<F> {
    fn from(file: F) -> Self {
        Self { file }
    }
}

impl<F: FileExt> LockableFile<F> {
    pub fn lock_shared<'s>(&'s self) -> std::io::Result<SharedFileLock<'s, F>> {
        FileExt::lock_shared(&self.file)?;
        Ok(SharedFileLock { file: &self.file })
    }

    pub fn lock_exclusive<'s>(&'s self) -> std::io::Result<ExclusiveFileLock<'s, F>> {
        FileExt::lock_exclusive(&self.file)?;
        Ok(ExclusiveFileLock { file: &self.file })
    }

    pub fn try_lock_exclusive<'s>(&'s self) -> std::io::Result<Option<ExclusiveFileLock<'s, F>>> {
        match FileExt::try_lock_exclusive(&self.file) {
            Ok(()) => Ok(Some(ExclusiveFileLock { file: &self.file })),
            Err(e) => {
                if e.kind() == lock_contended_error().kind() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl LockableFile<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(LockableFile { file })
    }
}
