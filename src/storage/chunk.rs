//! Fixed-size buffering of upload streams.
//!
//! Request bodies arrive in whatever pieces the transport hands us.  Block
//! uploads want uniform buffers, so [`rechunk`] regroups the stream into
//! `chunk_size` pieces (the last one may be shorter).

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};

struct Rechunk<S> {
    input: S,
    buf: BytesMut,
    done: bool,
}

/// Regroup `input` into chunks of exactly `chunk_size` bytes.
///
/// An input error is forwarded once and ends the stream.  An empty input
/// yields no chunks.
pub fn rechunk<S>(input: S, chunk_size: usize) -> impl Stream<Item = anyhow::Result<Bytes>>
where
    S: Stream<Item = anyhow::Result<Bytes>> + Unpin,
{
    let state = Rechunk {
        input,
        buf: BytesMut::new(),
        done: false,
    };
    stream::unfold(state, move |mut state| async move {
        loop {
            if state.buf.len() >= chunk_size {
                let chunk = state.buf.split_to(chunk_size).freeze();
                return Some((Ok(chunk), state));
            }
            if state.done {
                if state.buf.is_empty() {
                    return None;
                }
                let chunk = state.buf.split().freeze();
                return Some((Ok(chunk), state));
            }
            match state.input.next().await {
                Some(Ok(bytes)) => state.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    state.done = true;
                    state.buf.clear();
                    return Some((Err(e), state));
                }
                None => state.done = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn input(pieces: &[&'static [u8]]) -> impl Stream<Item = anyhow::Result<Bytes>> + Unpin {
        stream::iter(
            pieces
                .iter()
                .map(|p| Ok(Bytes::from_static(*p)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_rechunk_regroups_small_pieces() {
        let chunks: Vec<Bytes> = rechunk(input(&[b"ab", b"cde", b"f", b"ghij"]), 4)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks, vec![Bytes::from("abcd"), Bytes::from("efgh"), Bytes::from("ij")]);
    }

    #[tokio::test]
    async fn test_rechunk_splits_large_piece() {
        let chunks: Vec<Bytes> = rechunk(input(&[b"0123456789"]), 3)
            .try_collect()
            .await
            .unwrap();
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![3, 3, 3, 1]);
    }

    #[tokio::test]
    async fn test_rechunk_exact_multiple_has_no_empty_tail() {
        let chunks: Vec<Bytes> = rechunk(input(&[b"abcd", b"efgh"]), 4)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_rechunk_empty_input() {
        let chunks: Vec<Bytes> = rechunk(input(&[]), 4).try_collect().await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_rechunk_error_ends_stream() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(anyhow::anyhow!("connection reset")),
            Ok(Bytes::from_static(b"cd")),
        ]);
        let items: Vec<anyhow::Result<Bytes>> = rechunk(source, 4).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
