//! Cancellable stream copying and temp-file staging.

use std::path::{Path, PathBuf};

use tempfile::{Builder, TempPath};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::entry::BoxReader;
use super::error::DriveResult;
use crate::task::TaskCtx;

/// Buffer size for streaming copies. Cancellation is polled once per buffer.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy `reader` into `writer`, checking `ctx` for cancellation before every
/// chunk and reporting bytes through `ctx.progress`.
pub async fn copy_stream<R, W>(
    ctx: &TaskCtx,
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
) -> DriveResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut written = 0u64;
    loop {
        ctx.check()?;
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        written += n as u64;
        ctx.progress(n as i64, false);
    }
    writer.flush().await?;
    Ok(written)
}

/// A stream staged on local disk. The file is removed when this is dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    size: u64,
}

impl StagedFile {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the staged bytes for reading.
    pub async fn reader(&self) -> DriveResult<BoxReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }

    /// Rename the staged file to `dst`, replacing whatever is there. `dst`
    /// must be on the same filesystem as the staging directory.
    pub fn persist(self, dst: &Path) -> DriveResult<()> {
        self.path.persist(dst).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Drain `reader` into a temp file under `dir`.
///
/// The temp file is deleted if staging fails or is cancelled, and otherwise
/// when the returned [`StagedFile`] is dropped.
pub async fn stage_to_temp(
    ctx: &TaskCtx,
    dir: &Path,
    mut reader: BoxReader,
    buffer_size: usize,
) -> DriveResult<StagedFile> {
    tokio::fs::create_dir_all(dir).await?;
    let (file, path) = Builder::new()
        .prefix(".drivehub-")
        .tempfile_in(dir)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);
    let size = copy_stream(ctx, &mut reader, &mut file, buffer_size).await?;
    drop(file);
    Ok(StagedFile { path, size })
}

/// Default staging directory.
pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("drivehub")
}
