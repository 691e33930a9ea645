use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use quill_core::event::BusEvent;

use crate::routes::AppState;

/// `GET /event` — every bus event as one SSE data frame of
/// `{type, properties}`. A subscriber that falls behind sees a `bus.dropped`
/// marker; clients re-fetch state on reconnect.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.bus.subscribe_raw();
    Sse::new(bus_sse_stream(rx)).keep_alive(KeepAlive::default())
}

fn bus_sse_stream(
    rx: tokio::sync::broadcast::Receiver<BusEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).map(|item| Ok(Event::default().data(frame_data(item))))
}

/// JSON payload of one SSE frame; lag surfaces as a `bus.dropped` marker.
fn frame_data(item: Result<BusEvent, BroadcastStreamRecvError>) -> String {
    let event = match item {
        Ok(event) => event,
        Err(BroadcastStreamRecvError::Lagged(count)) => BusEvent::Dropped { count },
    };
    serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ids::SessionId;

    #[test]
    fn frames_carry_type_and_properties() {
        let data = frame_data(Ok(BusEvent::SessionIdle {
            session_id: SessionId::from_raw("ses_1"),
        }));
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["type"], "session.idle");
        assert_eq!(value["properties"]["session_id"], "ses_1");
    }

    #[test]
    fn lag_becomes_dropped_marker() {
        let data = frame_data(Err(BroadcastStreamRecvError::Lagged(6)));
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["type"], "bus.dropped");
        assert_eq!(value["properties"]["count"], 6);
    }
}
