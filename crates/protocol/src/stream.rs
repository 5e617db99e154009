use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::{Stream, StreamExt};

use super::frame::{Frame, FrameDecoder};

/// Lazily decodes frames out of a chunked byte stream.
///
/// Single pass: once the inner stream ends or yields an error, this stream is exhausted.
pub struct FrameStream<S> {
    inner: S,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
    finished: bool,
}

impl<S> FrameStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, B, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<Frame, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    let frames = this.decoder.push(chunk.as_ref());
                    this.ready.extend(frames);
                }
                Some(Err(error)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
                None => {
                    this.finished = true;
                    this.decoder.finish();
                }
            }
        }
    }
}
