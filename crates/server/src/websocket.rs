//! WebSocket handling
//!
//! One dispatch loop per extension connection: decode the frame, parse its
//! timestamp, run the tracker transition, apply the resulting effects. The
//! tracker is per-connection; the shared URL history lives in [`AppState`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use tabcal_protocol::{parse_recorded_time, ActivityMessage};

use crate::state::AppState;
use crate::tracker::{Effect, Input, Tracker};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one extension connection until it closes.
///
/// A clean close or a transport error both end the loop; an open session
/// with no trailing "end" frame is dropped with the connection.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let mut tracker = Tracker::new();

    while let Some(result) = socket.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let frame: ActivityMessage = match serde_json::from_str(text.as_str()) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(text.as_str(), 240),
                    "Failed to parse activity message"
                );
                continue;
            }
        };

        handle_activity_message(frame, &mut tracker, &state, conn_id).await;
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
}

/// Apply one decoded frame to this connection's tracker.
///
/// A frame with a malformed timestamp is dropped here; the connection
/// itself survives.
async fn handle_activity_message(
    frame: ActivityMessage,
    tracker: &mut Tracker,
    state: &AppState,
    conn_id: u64,
) {
    let time = match parse_recorded_time(&frame.recorded_time) {
        Ok(time) => time,
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.message.bad_timestamp",
                connection_id = conn_id,
                recorded_time = %frame.recorded_time,
                error = %e,
                "Dropping frame with malformed timestamp"
            );
            return;
        }
    };

    let input = if frame.time_type.is_end() {
        Input::End {
            url: frame.url.clone(),
            time,
        }
    } else {
        Input::Update {
            url: frame.url.clone(),
            time,
        }
    };

    let effects = tracker.transition(input);
    apply_effects(effects, state, conn_id).await;

    debug!(
        component = "websocket",
        event = "ws.session.current",
        connection_id = conn_id,
        url = %frame.url,
        time = %time,
        "Current session updated"
    );
}

async fn apply_effects(effects: Vec<Effect>, state: &AppState, conn_id: u64) {
    for effect in effects {
        match effect {
            Effect::ClockSkew { url, elapsed } => {
                warn!(
                    component = "websocket",
                    event = "ws.session.clock_skew",
                    connection_id = conn_id,
                    url = %url,
                    elapsed_secs = elapsed.num_seconds(),
                    "Frame timestamp earlier than session start, clamped to zero"
                );
            }
            Effect::RecordHistory { url, duration } => {
                let total = state.record_history(url.clone(), duration).await;
                debug!(
                    component = "websocket",
                    event = "ws.session.history",
                    connection_id = conn_id,
                    url = %url,
                    session_secs = duration.num_seconds(),
                    total_secs = total.num_seconds(),
                    "Recorded session duration"
                );
            }
            Effect::EmitEvent(event) => match state.sink() {
                Some(sink) => {
                    // Fire and forget: history is already recorded and a
                    // failure is never retried here.
                    if let Err(e) = sink.create_event(&event).await {
                        warn!(
                            component = "websocket",
                            event = "ws.event.create_failed",
                            connection_id = conn_id,
                            summary = %event.summary,
                            error = %e,
                            "Failed to create calendar event"
                        );
                    } else {
                        info!(
                            component = "websocket",
                            event = "ws.event.created",
                            connection_id = conn_id,
                            summary = %event.summary,
                            "Calendar event created"
                        );
                    }
                }
                None => {
                    warn!(
                        component = "websocket",
                        event = "ws.event.skipped",
                        connection_id = conn_id,
                        summary = %event.summary,
                        "No calendar sink available, event skipped"
                    );
                }
            },
        }
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::{handle_activity_message, ws_handler};
    use crate::calendar::{EventSink, SinkError};
    use crate::state::AppState;
    use crate::tracker::{CalendarEvent, Tracker};

    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{routing::get, Router};
    use chrono::TimeDelta;
    use tabcal_protocol::{parse_recorded_time, ActivityMessage, TimeType};

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<CalendarEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<CalendarEvent> {
            self.events.lock().expect("sink lock").clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn create_event(&self, event: &CalendarEvent) -> Result<(), SinkError> {
            self.events.lock().expect("sink lock").push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn create_event(&self, _event: &CalendarEvent) -> Result<(), SinkError> {
            Err(SinkError::Api("backend exploded".to_string()))
        }
    }

    fn frame(url: &str, recorded_time: &str, time_type: TimeType) -> ActivityMessage {
        ActivityMessage {
            url: url.to_string(),
            recorded_time: recorded_time.to_string(),
            time_type,
        }
    }

    #[tokio::test]
    async fn worked_example_creates_event_and_history() {
        let sink = Arc::new(RecordingSink::default());
        let state = AppState::new(Some(sink.clone() as Arc<dyn EventSink>));
        let mut tracker = Tracker::new();

        handle_activity_message(
            frame("a.com", "01/01/2024, 09:00:00 AM", TimeType::Start),
            &mut tracker,
            &state,
            1,
        )
        .await;
        handle_activity_message(
            frame("b.com", "01/01/2024, 09:06:00 AM", TimeType::End),
            &mut tracker,
            &state,
            1,
        )
        .await;

        assert_eq!(
            sink.events(),
            vec![CalendarEvent {
                summary: "a.com".to_string(),
                start: parse_recorded_time("01/01/2024, 09:00:00 AM").expect("valid"),
                end: parse_recorded_time("01/01/2024, 09:06:00 AM").expect("valid"),
            }]
        );
        assert_eq!(state.history_for("a.com").await, Some(TimeDelta::minutes(6)));
        assert_eq!(
            tracker.open_session().map(|s| s.url.as_str()),
            Some("b.com")
        );
    }

    #[tokio::test]
    async fn short_session_records_history_without_event() {
        let sink = Arc::new(RecordingSink::default());
        let state = AppState::new(Some(sink.clone() as Arc<dyn EventSink>));
        let mut tracker = Tracker::new();

        handle_activity_message(
            frame("a.com", "01/01/2024, 09:00:00 AM", TimeType::Start),
            &mut tracker,
            &state,
            1,
        )
        .await;
        handle_activity_message(
            frame("b.com", "01/01/2024, 09:04:59 AM", TimeType::End),
            &mut tracker,
            &state,
            1,
        )
        .await;

        assert!(sink.events().is_empty());
        assert_eq!(
            state.history_for("a.com").await,
            Some(TimeDelta::seconds(4 * 60 + 59))
        );
    }

    #[tokio::test]
    async fn sink_failure_still_records_history() {
        let state = AppState::new(Some(Arc::new(FailingSink) as Arc<dyn EventSink>));
        let mut tracker = Tracker::new();

        handle_activity_message(
            frame("a.com", "01/01/2024, 09:00:00 AM", TimeType::Start),
            &mut tracker,
            &state,
            1,
        )
        .await;
        handle_activity_message(
            frame("b.com", "01/01/2024, 09:10:00 AM", TimeType::End),
            &mut tracker,
            &state,
            1,
        )
        .await;

        assert_eq!(
            state.history_for("a.com").await,
            Some(TimeDelta::minutes(10))
        );
    }

    #[tokio::test]
    async fn missing_sink_skips_the_event() {
        let state = AppState::new(None);
        let mut tracker = Tracker::new();

        handle_activity_message(
            frame("a.com", "01/01/2024, 09:00:00 AM", TimeType::Start),
            &mut tracker,
            &state,
            1,
        )
        .await;
        handle_activity_message(
            frame("b.com", "01/01/2024, 09:10:00 AM", TimeType::End),
            &mut tracker,
            &state,
            1,
        )
        .await;

        // Local bookkeeping is unaffected by the missing sink.
        assert_eq!(
            state.history_for("a.com").await,
            Some(TimeDelta::minutes(10))
        );
    }

    #[tokio::test]
    async fn malformed_timestamp_drops_only_that_frame() {
        let sink = Arc::new(RecordingSink::default());
        let state = AppState::new(Some(sink.clone() as Arc<dyn EventSink>));
        let mut tracker = Tracker::new();

        handle_activity_message(
            frame("a.com", "01/01/2024, 09:00:00 AM", TimeType::Start),
            &mut tracker,
            &state,
            1,
        )
        .await;
        handle_activity_message(
            frame("b.com", "yesterday-ish", TimeType::End),
            &mut tracker,
            &state,
            1,
        )
        .await;

        // The bad frame neither closed nor rotated the session.
        assert!(sink.events().is_empty());
        assert_eq!(state.history_for("a.com").await, None);
        assert_eq!(
            tracker.open_session().map(|s| s.url.as_str()),
            Some("a.com")
        );
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn loopback_session_flow() {
        use futures::SinkExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let sink = Arc::new(RecordingSink::default());
        let state = Arc::new(AppState::new(Some(sink.clone() as Arc<dyn EventSink>)));

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");

        ws.send(WsMessage::text(
            r#"{"url":"a.com","recordedTime":"01/01/2024, 09:00:00 AM","timeType":"start"}"#,
        ))
        .await
        .expect("send start frame");
        ws.send(WsMessage::text(
            r#"{"url":"b.com","recordedTime":"01/01/2024, 09:06:00 AM","timeType":"end"}"#,
        ))
        .await
        .expect("send end frame");

        wait_for(|| {
            let state = state.clone();
            async move { state.history_for("a.com").await.is_some() }
        })
        .await;

        assert_eq!(state.history_for("a.com").await, Some(TimeDelta::minutes(6)));
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.events()[0].summary, "a.com");

        // Closing mid-session: b.com is open with no trailing "end".
        ws.close(None).await.expect("close");

        tokio::time::sleep(Duration::from_millis(100)).await;
        // No second event was ever produced and the server kept running.
        assert_eq!(sink.events().len(), 1);
        assert_eq!(state.history_for("b.com").await, None);
    }

    #[tokio::test]
    async fn malformed_json_keeps_the_connection_alive() {
        use futures::SinkExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let sink = Arc::new(RecordingSink::default());
        let state = Arc::new(AppState::new(Some(sink.clone() as Arc<dyn EventSink>)));

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");

        ws.send(WsMessage::text("{not json")).await.expect("send garbage");
        ws.send(WsMessage::text(
            r#"{"url":"a.com","recordedTime":"01/01/2024, 09:00:00 AM","timeType":"start"}"#,
        ))
        .await
        .expect("send start frame");
        ws.send(WsMessage::text(
            r#"{"url":"b.com","recordedTime":"01/01/2024, 09:06:00 AM","timeType":"end"}"#,
        ))
        .await
        .expect("send end frame");

        wait_for(|| {
            let state = state.clone();
            async move { state.history_for("a.com").await.is_some() }
        })
        .await;

        assert_eq!(sink.events().len(), 1);
    }
}
