use bytes::BytesMut;
use std::{
    io::{Cursor, Error, Read},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::Encoder;

/// In-memory stream end: reads come from a pre-encoded buffer, writes
/// land in an inspectable one.
#[derive(Default)]
pub struct TestStream {
    input: BytesMut,
    output: Cursor<BytesMut>,
}

impl TestStream {
    pub fn with_output<I, C>(item: I, encoder: &mut C) -> Result<Self, <C as Encoder<I>>::Error>
    where
        C: Encoder<I>,
    {
        let mut buf = BytesMut::new();
        encoder.encode(item, &mut buf)?;
        Ok(TestStream {
            input: BytesMut::new(),
            output: Cursor::new(buf),
        })
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }
}

impl AsyncWrite for TestStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        self.get_mut().input.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for TestStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        let read = self.get_mut().output.read(unfilled)?;
        buf.advance(read);
        Poll::Ready(Ok(()))
    }
}
