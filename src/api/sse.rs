// SSE endpoint - the live event stream
//
// Each connected client owns one broker subscription. The reader is a
// plain Stream over the subscription queue; axum's keep-alive layer writes
// the 15s comment heartbeats so intermediaries do not tear the stream.
// Dropping the stream (client disconnect, task cancellation) unsubscribes
// via the guard's Drop, which closes the queue.

use super::AppState;
use crate::broker::EventBroker;
use crate::capture::Capture;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// GET /events - stream capture mutations as JSON-encoded captures.
/// Control events ride the same schema with `notes` sentinels; deletions
/// carry `deleted: true`.
pub(super) async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broker.subscribe();
    let stream = EventStream {
        rx: subscription.rx,
        id: subscription.id,
        broker: state.broker.clone(),
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

/// Subscription-backed stream that detaches itself when dropped
struct EventStream {
    rx: mpsc::Receiver<Capture>,
    id: u64,
    broker: Arc<EventBroker>,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(capture)) => match serde_json::to_string(&capture) {
                Ok(json) => Poll::Ready(Some(Ok(Event::default().data(json)))),
                Err(e) => {
                    // A capture that cannot serialize is a bug, not a
                    // reason to kill the stream
                    tracing::error!("Failed to serialize capture {}: {}", capture.id, e);
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            },
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}
