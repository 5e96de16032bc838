//! Bidirectional splice between two byte endpoints.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool;

const COPY_BUFFER: usize = 16 * 1024;

/// Copies `a -> b` and `b -> a` concurrently until each direction hits
/// EOF or an error, and returns the total number of bytes moved.
///
/// The splice closes nothing: one direction ending leaves the other
/// untouched, and the caller owns both endpoint lifetimes. Errors are not
/// propagated; a failed direction just stops contributing bytes.
pub async fn join<A, B>(a: A, b: B) -> u64
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let (a_to_b, b_to_a) = tokio::join!(
        pipe(&mut a_read, &mut b_write),
        pipe(&mut b_read, &mut a_write),
    );
    a_to_b + b_to_a
}

/// One copy direction of the splice. The link worker drives the two
/// directions itself so it can observe either one ending.
pub(crate) async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool::get(COPY_BUFFER);
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn moves_bytes_both_ways_and_counts_them() {
        let (a_far, a_near) = tokio::io::duplex(4096);
        let (b_far, b_near) = tokio::io::duplex(4096);

        let splice = tokio::spawn(join(a_near, b_near));

        let (mut a_read, mut a_write) = tokio::io::split(a_far);
        let (mut b_read, mut b_write) = tokio::io::split(b_far);

        a_write.write_all(b"from a, with love").await.unwrap();
        a_write.shutdown().await.unwrap();
        b_write.write_all(b"from b").await.unwrap();
        b_write.shutdown().await.unwrap();

        let mut at_b = Vec::new();
        b_read.read_to_end(&mut at_b).await.unwrap();
        assert_eq!(at_b, b"from a, with love");

        let mut at_a = Vec::new();
        a_read.read_to_end(&mut at_a).await.unwrap();
        assert_eq!(at_a, b"from b");

        let total = splice.await.unwrap();
        assert_eq!(total, (at_a.len() + at_b.len()) as u64);
    }

    #[tokio::test]
    async fn one_direction_ending_does_not_stop_the_other() {
        let (a_far, a_near) = tokio::io::duplex(4096);
        let (b_far, b_near) = tokio::io::duplex(4096);

        let splice = tokio::spawn(join(a_near, b_near));

        let (mut a_read, mut a_write) = tokio::io::split(a_far);
        let (mut b_read, mut b_write) = tokio::io::split(b_far);

        // End a -> b immediately.
        a_write.shutdown().await.unwrap();

        // The other direction still works afterwards.
        b_write.write_all(b"still alive").await.unwrap();
        let mut got = [0u8; 11];
        a_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"still alive");

        b_write.shutdown().await.unwrap();
        let total = splice.await.unwrap();
        assert_eq!(total, b"still alive".len() as u64);

        // Nothing traveled a -> b, and the splice closed nothing on its
        // own: b's inbound half only ended when the spliced endpoints were
        // dropped after `join` returned.
        let mut at_b = Vec::new();
        b_read.read_to_end(&mut at_b).await.unwrap();
        assert!(at_b.is_empty());
    }

    #[tokio::test]
    async fn large_transfer_is_intact() {
        let (a_far, a_near) = tokio::io::duplex(8192);
        let (b_far, b_near) = tokio::io::duplex(8192);

        let splice = tokio::spawn(join(a_near, b_near));

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (_a_read, mut a_write) = tokio::io::split(a_far);
        let (mut b_read, b_write) = tokio::io::split(b_far);
        // b -> a carries nothing; end it so the splice can finish.
        drop(b_write);

        let writer = tokio::spawn(async move {
            a_write.write_all(&payload).await.unwrap();
            a_write.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        b_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);

        writer.await.unwrap();
        let total = splice.await.unwrap();
        assert_eq!(total, expected.len() as u64);
    }
}
