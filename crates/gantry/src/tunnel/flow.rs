use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Pumps bytes in both directions between two endpoints.
///
/// EOF in one direction is propagated as a shutdown of the other side's
/// write half, so half-closes travel end to end: when the external side
/// stops sending, the stream is closed for writing, and when the stream
/// ends, the external socket is. The flow finishes once both directions
/// have drained, or on the first I/O error. Returns (a→b, b→a) byte
/// counts.
pub async fn splice<A, B>(mut a: A, mut b: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let res = tokio::io::copy_bidirectional(&mut a, &mut b).await;
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forwards_both_directions_and_propagates_close() {
        let (left_near, mut left_far) = tokio::io::duplex(1024);
        let (right_near, mut right_far) = tokio::io::duplex(1024);

        let pump = tokio::spawn(splice(left_near, right_near));

        left_far.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        right_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        right_far.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        left_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // Half-close on the left reaches the right as EOF.
        left_far.shutdown().await.unwrap();
        let n = right_far.read(&mut [0u8; 16]).await.unwrap();
        assert_eq!(n, 0);

        // The flow ends once the right side closes too.
        drop(right_far);
        let (a_to_b, b_to_a) = pump.await.unwrap().unwrap();
        assert_eq!(a_to_b, 7);
        assert_eq!(b_to_a, 5);
    }
}
