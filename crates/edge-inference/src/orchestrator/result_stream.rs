//! Bounded channel between a request's pipeline task and its caller.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::runner::InferenceResult;

/// Caller side. Yields partial results in emission order, then the terminal
/// result, then ends. Once the request is cancelled it ends immediately, even
/// if results are still buffered.
pub struct ResultStream {
    request_id: String,
    inner: ReceiverStream<InferenceResult>,
    cancel: CancellationToken,
    done: bool,
}

impl ResultStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for ResultStream {
    type Item = InferenceResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done || self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(result)) => {
                if self.cancel.is_cancelled() {
                    self.done = true;
                    return Poll::Ready(None);
                }
                if result.is_terminal() {
                    self.done = true;
                }
                Poll::Ready(Some(result))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Producer side. `finish` consumes the sink, so a second terminal result
/// cannot be sent.
pub struct ResultSink {
    tx: mpsc::Sender<InferenceResult>,
}

impl ResultSink {
    /// Forward a partial result. Returns false once the caller has gone away.
    pub async fn emit_partial(&self, mut result: InferenceResult) -> bool {
        result.partial = true;
        self.tx.send(result).await.is_ok()
    }

    pub async fn finish(self, mut result: InferenceResult) {
        result.partial = false;
        let _ = self.tx.send(result).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn channel(request_id: &str, capacity: usize, cancel: CancellationToken) -> (ResultSink, ResultStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ResultSink { tx },
        ResultStream {
            request_id: request_id.to_string(),
            inner: ReceiverStream::new(rx),
            cancel,
            done: false,
        },
    )
}
