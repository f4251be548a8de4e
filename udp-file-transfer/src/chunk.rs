//! Source and destination collaborators.
//!
//! The engines never touch files directly: the sender pulls chunks from any
//! [`AsyncRead`] and the consumer pushes them into any [`AsyncWrite`].  The
//! `open_*` helpers are the file-backed versions the binary uses.

use std::io;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read up to `max` bytes, looping over short reads.
///
/// Returns `None` at end of input.  A returned chunk is shorter than `max`
/// only when the input ended inside it.
pub async fn read_chunk<R>(reader: &mut R, max: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf))
}

/// Write all of `bytes`.
pub async fn write_chunk<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(bytes).await
}

pub async fn open_source(path: impl AsRef<Path>) -> io::Result<File> {
    File::open(path).await
}

/// Create (or truncate) the destination file.
pub async fn open_destination(path: impl AsRef<Path>) -> io::Result<File> {
    File::create(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_full_chunks_then_remainder() {
        let mut src = Cursor::new(vec![7u8; 10]);
        assert_eq!(read_chunk(&mut src, 4).await.unwrap().unwrap().len(), 4);
        assert_eq!(read_chunk(&mut src, 4).await.unwrap().unwrap().len(), 4);
        assert_eq!(read_chunk(&mut src, 4).await.unwrap().unwrap().len(), 2);
        assert!(read_chunk(&mut src, 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_reads_are_coalesced() {
        // A duplex pipe delivers each write as a separate short read.
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for piece in [&b"ab"[..], b"cd", b"e"] {
                tx.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        let chunk = read_chunk(&mut rx, 5).await.unwrap().unwrap();
        assert_eq!(chunk, b"abcde");
    }

    #[tokio::test]
    async fn empty_input_is_eof() {
        let mut src = Cursor::new(Vec::<u8>::new());
        assert!(read_chunk(&mut src, 1460).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_chunk_appends() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"he").await.unwrap();
        write_chunk(&mut out, b"llo").await.unwrap();
        assert_eq!(out, b"hello");
    }
}
