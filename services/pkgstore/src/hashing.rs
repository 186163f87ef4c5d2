use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::digest::Digest;

/// Computes SHA-256 over every byte read through it.
#[pin_project]
#[derive(Debug)]
pub(crate) struct HashingReader<R> {
    #[pin]
    inner: R,
    hasher: Sha256,
    size: u64,
}

impl<R> HashingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    /// Digest and length of the bytes read so far.
    pub(crate) fn finish(&self) -> (Digest, u64) {
        (Digest::from_hasher(self.hasher.clone()), self.size)
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let fresh = &buf.filled()[before..];
            this.hasher.update(fresh);
            *this.size += fresh.len() as u64;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn hashes_chained_input() {
        let chained = Cursor::new(b"hello".to_vec()).chain(Cursor::new(b"world".to_vec()));
        let mut reader = HashingReader::new(chained);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        let (digest, size) = reader.finish();
        assert_eq!(out, b"helloworld");
        assert_eq!(size, 10);
        assert_eq!(digest, Digest::of(b"helloworld"));
    }
}
