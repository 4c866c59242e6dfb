//! Git pkt-line framing.
//!
//! A pkt-line is a 4-character hex length prefix (covering itself plus the
//! payload) followed by the payload; the literal `0000` is the flush marker.
//!
//! <https://git-scm.com/docs/protocol-common#_pkt_line_format>

use std::fmt::Write as _;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Largest total pkt-line size (prefix + payload) the framing can express.
const MAX_PKT_LEN: usize = 0xFFFF;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append one pkt-line to `buf`.
pub fn encode_pkt_line(buf: &mut BytesMut, payload: &str) -> Result<(), Error> {
    let total = payload.len() + 4;
    if total > MAX_PKT_LEN {
        return Err(Error::PktLineOverflow(payload.len()));
    }
    write!(buf, "{total:04x}").expect("writing to BytesMut cannot fail");
    buf.extend_from_slice(payload.as_bytes());
    Ok(())
}

/// Append the flush marker to `buf`.
pub fn encode_flush(buf: &mut BytesMut) {
    buf.extend_from_slice(b"0000");
}

// ---------------------------------------------------------------------------
// Async writer helpers
// ---------------------------------------------------------------------------

/// Write one pkt-line to `w`.
pub async fn write_pkt_line<W>(w: &mut W, payload: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    encode_pkt_line(&mut buf, payload)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// Write the flush marker to `w`.
pub async fn write_flush<W>(w: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(b"0000").await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Flushing writer
// ---------------------------------------------------------------------------

/// Writer wrapper that flushes the inner writer after every write.
///
/// Smart-HTTP responses for `upload-pack`/`receive-pack` must reach the
/// client as the subprocess produces them; wrapping the response sink in
/// this keeps each packet from sitting in a buffer until the RPC ends.
pub struct FlushingWriter<W> {
    inner: W,
    needs_flush: bool,
}

impl<W> FlushingWriter<W> {
    pub fn new(inner: W) -> Self {
        FlushingWriter {
            inner,
            needs_flush: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FlushingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        if me.needs_flush {
            match Pin::new(&mut me.inner).poll_flush(cx) {
                Poll::Ready(Ok(())) => me.needs_flush = false,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                me.needs_flush = true;
                // Opportunistic flush; if the sink is not ready the next
                // write or shutdown finishes it.
                if let Poll::Ready(Err(e)) = Pin::new(&mut me.inner).poll_flush(cx) {
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        let res = Pin::new(&mut me.inner).poll_flush(cx);
        if let Poll::Ready(Ok(())) = res {
            me.needs_flush = false;
        }
        res
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(payload: &str) -> String {
        let mut buf = BytesMut::new();
        encode_pkt_line(&mut buf, payload).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn pkt_line_prefix_covers_itself() {
        assert_eq!(pkt(""), "0004");
        assert_eq!(pkt("0"), "00050");
        assert_eq!(pkt("10"), "000610");
        assert_eq!(pkt("100"), "0007100");
        assert_eq!(pkt("1000"), "00081000");
    }

    #[test]
    fn service_banner() {
        assert_eq!(
            pkt("# service=git-upload-pack\n"),
            "001e# service=git-upload-pack\n"
        );
    }

    #[test]
    fn flush_is_four_zeros() {
        let mut buf = BytesMut::new();
        encode_flush(&mut buf);
        assert_eq!(&buf[..], b"0000");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = BytesMut::new();
        let payload = "x".repeat(MAX_PKT_LEN - 3);
        let err = encode_pkt_line(&mut buf, &payload).unwrap_err();
        assert!(matches!(err, Error::PktLineOverflow(_)));
    }

    #[tokio::test]
    async fn async_writers_match_sync_encoding() {
        let mut out = Vec::new();
        write_pkt_line(&mut out, "# service=git-receive-pack\n")
            .await
            .unwrap();
        write_flush(&mut out).await.unwrap();
        assert_eq!(out, b"001f# service=git-receive-pack\n0000");
    }

    #[tokio::test]
    async fn flushing_writer_passes_bytes_through() {
        let mut sink = Vec::new();
        {
            let mut w = FlushingWriter::new(&mut sink);
            w.write_all(b"0008abcd").await.unwrap();
            w.flush().await.unwrap();
        }
        assert_eq!(sink, b"0008abcd");
    }
}
