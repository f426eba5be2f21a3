//! Large objects.
//!
//! Large objects are stored server-side and accessed through descriptors
//! that only live as long as the transaction that opened them. Every
//! operation therefore runs in a [`Transaction`], and an open
//! [`LargeObject`] borrows it, so the transaction cannot be committed or
//! rolled back while the descriptor is in use.

use std::io::SeekFrom;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::Oid;

const INV_WRITE: i32 = 0x0002_0000;
const INV_READ: i32 = 0x0004_0000;

/// Chunk size for file import and export.
const CHUNK_SIZE: usize = 256 * 1024;

/// Access requested when opening a large object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    fn flags(self) -> i32 {
        match self {
            OpenMode::Read => INV_READ,
            OpenMode::Write => INV_WRITE,
            OpenMode::ReadWrite => INV_READ | INV_WRITE,
        }
    }
}

/// An open large object descriptor.
///
/// ```ignore
/// let tx = conn.begin().await?;
/// let oid = LargeObject::create(&tx, None).await?;
/// let mut lo = LargeObject::open(&tx, oid, OpenMode::ReadWrite).await?;
/// lo.write(b"hello").await?;
/// lo.seek(SeekFrom::Start(0)).await?;
/// assert_eq!(lo.read(5).await?, b"hello");
/// lo.close().await?;
/// ```
#[derive(Debug)]
pub struct LargeObject<'t> {
    tx: &'t Transaction,
    oid: Oid,
    fd: i32,
}

impl<'t> LargeObject<'t> {
    /// Create an empty large object. With `desired` the object gets that
    /// identifier, otherwise the server picks one.
    pub async fn create(tx: &Transaction, desired: Option<Oid>) -> Result<Oid> {
        let oid: Oid = tx
            .execute("SELECT lo_create($1)", desired.unwrap_or(Oid::INVALID))
            .await?
            .one()?;
        debug!(oid = oid.0, "large object created");
        Ok(oid)
    }

    /// Delete a large object.
    pub async fn remove(tx: &Transaction, oid: Oid) -> Result<()> {
        tx.execute("SELECT lo_unlink($1)", oid).await?;
        debug!(oid = oid.0, "large object removed");
        Ok(())
    }

    pub async fn open(tx: &'t Transaction, oid: Oid, mode: OpenMode) -> Result<Self> {
        let fd: i32 = tx
            .execute("SELECT lo_open($1, $2)", (oid, mode.flags()))
            .await?
            .one()?;
        Ok(Self { tx, oid, fd })
    }

    /// Create a large object from the contents of a local file.
    pub async fn import_file(
        tx: &Transaction,
        path: impl AsRef<Path>,
        desired: Option<Oid>,
    ) -> Result<Oid> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::LargeObject(format!("reading {}: {}", path.display(), e)))?;

        let oid = Self::create(tx, desired).await?;
        let mut lo = LargeObject::open(tx, oid, OpenMode::Write).await?;
        for chunk in data.chunks(CHUNK_SIZE) {
            lo.write(chunk).await?;
        }
        lo.close().await?;
        debug!(oid = oid.0, bytes = data.len(), path = %path.display(), "large object imported");
        Ok(oid)
    }

    /// Write the contents of a large object to a local file.
    pub async fn export_file(tx: &Transaction, oid: Oid, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut lo = LargeObject::open(tx, oid, OpenMode::Read).await?;
        let mut data = Vec::new();
        loop {
            let chunk = lo.read(CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        lo.close().await?;

        tokio::fs::write(path, &data)
            .await
            .map_err(|e| Error::LargeObject(format!("writing {}: {}", path.display(), e)))?;
        debug!(oid = oid.0, bytes = data.len(), path = %path.display(), "large object exported");
        Ok(())
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Read up to `len` bytes from the current position. An empty result
    /// means the end of the object.
    pub async fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let len = i32::try_from(len)
            .map_err(|_| Error::LargeObject(format!("read length {} too large", len)))?;
        self.tx
            .execute("SELECT loread($1, $2)", (self.fd, len))
            .await?
            .one()
    }

    /// Write `data` at the current position; returns the bytes written.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let written: i32 = self
            .tx
            .execute("SELECT lowrite($1, $2)", (self.fd, data))
            .await?
            .one()?;
        usize::try_from(written)
            .map_err(|_| Error::Protocol(format!("lowrite returned {}", written)))
    }

    /// Truncate or zero-extend the object to `len` bytes.
    pub async fn resize(&mut self, len: u64) -> Result<()> {
        let len = i64::try_from(len)
            .map_err(|_| Error::LargeObject(format!("size {} too large", len)))?;
        self.tx
            .execute("SELECT lo_truncate64($1, $2)", (self.fd, len))
            .await?;
        Ok(())
    }

    /// Move the position; returns the new position from the start.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => (
                i64::try_from(offset)
                    .map_err(|_| Error::LargeObject(format!("offset {} too large", offset)))?,
                0,
            ),
            SeekFrom::Current(offset) => (offset, 1),
            SeekFrom::End(offset) => (offset, 2),
        };
        let position: i64 = self
            .tx
            .execute("SELECT lo_lseek64($1, $2, $3)", (self.fd, offset, whence))
            .await?
            .one()?;
        to_position(position)
    }

    /// Current position from the start.
    pub async fn tell(&self) -> Result<u64> {
        let position: i64 = self
            .tx
            .execute("SELECT lo_tell64($1)", self.fd)
            .await?
            .one()?;
        to_position(position)
    }

    /// Release the descriptor. Descriptors not closed explicitly are
    /// released when the transaction ends.
    pub async fn close(self) -> Result<()> {
        self.tx.execute("SELECT lo_close($1)", self.fd).await?;
        Ok(())
    }
}

fn to_position(position: i64) -> Result<u64> {
    u64::try_from(position).map_err(|_| Error::Protocol(format!("negative position {}", position)))
}
