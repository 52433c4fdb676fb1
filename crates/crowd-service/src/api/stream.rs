//! Live outputs: the MJPEG video feed and the websocket event stream.

use crate::render::RenderedFrame;
use crate::state::ServiceState;
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use common::crowd::CrowdEvent;
use futures::{sink::SinkExt, stream::Stream, stream::StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use telemetry::metrics::CROWD_LIVE_CLIENTS;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const BOUNDARY: &str = "frame";

/// Multipart MJPEG of the latest rendered frame. Each new frame is pushed
/// as soon as the pipeline publishes it; clients never see stale duplicates.
pub async fn video_feed(State(state): State<ServiceState>) -> Response {
    let body = Body::from_stream(mjpeg_stream(state.watch_frames()));
    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

/// Yields the current frame (if any) and then every newly published one.
/// Ends when the frame slot is dropped.
pub fn mjpeg_stream(
    frames: watch::Receiver<Option<Arc<RenderedFrame>>>,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold((frames, true), |(mut frames, mut first)| async move {
        loop {
            if !first && frames.changed().await.is_err() {
                return None;
            }
            first = false;

            let latest = frames.borrow_and_update().clone();
            if let Some(frame) = latest {
                return Some((Ok(multipart_part(&frame.jpeg)), (frames, false)));
            }
        }
    })
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServiceState>) -> Response {
    let events = state.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

async fn handle_socket(socket: WebSocket, mut events: broadcast::Receiver<CrowdEvent>) {
    CROWD_LIVE_CLIENTS.inc();
    info!("live client connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize crowd event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live client lagging, dropped events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Inbound messages are ignored; the loop only watches for disconnects
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                debug!("live client sent close");
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    CROWD_LIVE_CLIENTS.dec();
    info!("live client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame(index: u64) -> Arc<RenderedFrame> {
        Arc::new(RenderedFrame {
            frame_index: index,
            count: 0,
            width: 2,
            height: 2,
            jpeg: Bytes::from(vec![0xFF, 0xD8, index as u8, 0xFF, 0xD9]),
            rendered_at: Utc::now(),
        })
    }

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(&[1, 2, 3]);
        let expected =
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n\x01\x02\x03\r\n";
        assert_eq!(&part[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_stream_starts_with_current_frame() {
        let (tx, rx) = watch::channel(Some(frame(1)));
        let mut stream = Box::pin(mjpeg_stream(rx));

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.ends_with(&[0xFF, 0xD8, 1, 0xFF, 0xD9, b'\r', b'\n']));

        tx.send_replace(Some(frame(2)));
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.ends_with(&[0xFF, 0xD8, 2, 0xFF, 0xD9, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_stream_waits_for_first_frame_and_ends_with_slot() {
        let (tx, rx) = watch::channel(None);
        let mut stream = Box::pin(mjpeg_stream(rx));

        // A reset to empty is skipped, not emitted
        tx.send_replace(None);
        tx.send_replace(Some(frame(7)));
        let part = stream.next().await.unwrap().unwrap();
        assert!(part.starts_with(b"--frame\r\n"));

        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
