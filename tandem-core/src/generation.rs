//! Caller-side handle for one submitted request.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::decoder::StreamingDecoder;
use crate::request::{GenerationEvent, GenerationMetrics, RequestId};

/// Cloneable flag that asks the scheduler to stop a generation
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Takes effect at the next tick boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Ordered stream of token fragments for one request
///
/// Dropping the handle cancels the generation.
#[derive(Debug)]
pub struct Generation {
    id: RequestId,
    events: UnboundedReceiver<GenerationEvent>,
    cancel: CancelHandle,
    metrics: Option<GenerationMetrics>,
}

impl Generation {
    pub(crate) fn new(
        id: RequestId,
        events: UnboundedReceiver<GenerationEvent>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            id,
            events,
            cancel,
            metrics: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the next token's raw bytes. `None` once the generation ended.
    pub async fn next_fragment(&mut self) -> Option<Vec<u8>> {
        if self.metrics.is_some() {
            return None;
        }
        match self.events.recv().await? {
            GenerationEvent::Token(bytes) => Some(bytes),
            GenerationEvent::Finished(metrics) => {
                self.metrics = Some(metrics);
                None
            }
        }
    }

    /// Non-blocking variant of [`next_fragment`](Self::next_fragment).
    pub fn try_next_fragment(&mut self) -> Option<Vec<u8>> {
        if self.metrics.is_some() {
            return None;
        }
        match self.events.try_recv().ok()? {
            GenerationEvent::Token(bytes) => Some(bytes),
            GenerationEvent::Finished(metrics) => {
                self.metrics = Some(metrics);
                None
            }
        }
    }

    /// Drain the remaining fragments and decode them once.
    pub async fn collect_text(&mut self) -> String {
        let mut bytes = Vec::new();
        while let Some(fragment) = self.next_fragment().await {
            bytes.extend_from_slice(&fragment);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Available once the final event has been received.
    pub fn metrics(&self) -> Option<&GenerationMetrics> {
        self.metrics.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.metrics.is_some()
    }

    /// Decode fragments into complete UTF-8 chunks as they arrive.
    pub fn text_stream(self) -> TextStream {
        TextStream {
            generation: self,
            decoder: StreamingDecoder::new(),
            done: false,
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if self.metrics.is_none() {
            self.cancel.cancel();
        }
    }
}

/// [`Stream`] of text chunks backed by a [`StreamingDecoder`]
#[derive(Debug)]
pub struct TextStream {
    generation: Generation,
    decoder: StreamingDecoder,
    done: bool,
}

impl TextStream {
    pub fn metrics(&self) -> Option<&GenerationMetrics> {
        self.generation.metrics()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.generation.cancel_handle()
    }
}

impl Stream for TextStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.generation.events.poll_recv(cx) {
                Poll::Ready(Some(GenerationEvent::Token(bytes))) => {
                    if let Some(text) = this.decoder.next_fragment(&bytes) {
                        return Poll::Ready(Some(text));
                    }
                }
                Poll::Ready(Some(GenerationEvent::Finished(metrics))) => {
                    this.generation.metrics = Some(metrics);
                    this.done = true;
                    return Poll::Ready(this.decoder.finish());
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(this.decoder.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
