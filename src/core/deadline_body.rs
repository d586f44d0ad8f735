//! Response body bounded by the request deadline.
//!
//! The forwarder hands back the backend response as soon as its headers
//! arrive. Wrapping the body keeps the rest of the transfer under the same
//! deadline: once it passes, the stream ends with [`BodyDeadlineElapsed`] and
//! the upstream body is dropped.
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::{BoxError, body::Body as AxumBody};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::time::{Instant, Sleep, sleep_until};

use crate::config::validation::MAX_DURATION_SECS;

/// `timeout` from now, saturating at the longest duration the gateway accepts.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(MAX_DURATION_SECS))
}

#[derive(Debug, thiserror::Error)]
#[error("request deadline elapsed while streaming the response body")]
pub struct BodyDeadlineElapsed;

pub struct DeadlineBody {
    inner: AxumBody,
    sleep: Pin<Box<Sleep>>,
    expired: bool,
}

impl DeadlineBody {
    pub fn new(inner: AxumBody, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: Box::pin(sleep_until(deadline)),
            expired: false,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|result| result.map_err(Into::into)));
        }

        match this.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.expired = true;
                this.inner = AxumBody::empty();
                Poll::Ready(Some(Err(Box::new(BodyDeadlineElapsed))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.expired {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}
