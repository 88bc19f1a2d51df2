//! Realtime endpoint: every hub frame goes out to the socket, every client frame is relayed
//! to all subscribers (the sender included).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use kubelive_hub::{Frame, Hub, Subscription};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::error::ServerResult;
use crate::state::AppState;

/// GET /ws. The subscriber is attached before the upgrade so a full hub answers 503.
pub async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> ServerResult<Response> {
    let sub = state.hub().attach()?;
    let hub = Arc::clone(state.hub());
    let ping = state.config().ws_ping_interval;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, sub, ping)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, sub: Subscription, ping: Duration) {
    let id = sub.id();
    info!(subscriber = %id, "websocket connected");
    let (sender, receiver) = socket.split();

    let mut send_task = tokio::spawn(forward_frames(sender, sub, ping));
    let relay_hub = Arc::clone(&hub);
    let mut recv_task = tokio::spawn(async move { relay_incoming(receiver, &relay_hub).await });

    tokio::select! {
        _ = &mut send_task => {
            debug!(subscriber = %id, "send side finished");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!(subscriber = %id, "receive side finished");
            send_task.abort();
        }
    }

    hub.detach(id);
    info!(subscriber = %id, "websocket closed");
}

/// Drain the subscription into the socket, pinging on a fixed interval.
async fn forward_frames(mut sender: SplitSink<WebSocket, Message>, mut sub: Subscription, ping: Duration) {
    let mut ticker = interval_at(Instant::now() + ping, ping);
    loop {
        let msg = tokio::select! {
            frame = sub.recv() => match frame {
                Some(frame) => frame_to_message(frame),
                // detached by the hub: slow consumer or shutdown
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };
        if sender.send(msg).await.is_err() {
            break;
        }
    }
}

async fn relay_incoming(mut receiver: SplitStream<WebSocket>, hub: &Hub) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(msg) => {
                if !relay_message(msg, hub) {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "websocket receive error");
                break;
            }
        }
    }
}

/// Rebroadcast one client message. Returns `false` when the client closed.
pub fn relay_message(msg: Message, hub: &Hub) -> bool {
    match msg {
        Message::Text(text) => {
            hub.broadcast(Frame::Text(Bytes::from(text)));
        }
        Message::Binary(data) => {
            hub.broadcast(Frame::Binary(data));
        }
        Message::Ping(_) | Message::Pong(_) => {}
        Message::Close(_) => return false,
    }
    true
}

/// Shares the frame's buffer with the message; nothing is copied per subscriber.
pub fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(bytes) => match Utf8Bytes::try_from(bytes.clone()) {
            Ok(text) => Message::Text(text),
            Err(_) => Message::Binary(bytes),
        },
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelive_hub::HubConfig;

    #[test]
    fn client_frames_reach_every_subscriber_with_their_type() {
        let hub = Hub::new(HubConfig::default());
        let mut sender = hub.attach().expect("attach");
        let mut peer = hub.attach().expect("attach");

        assert!(relay_message(Message::Text("hi".to_string().into()), &hub));
        assert!(relay_message(Message::Binary(Bytes::from_static(b"\x00\x01")), &hub));

        for sub in [&mut sender, &mut peer] {
            assert_eq!(sub.try_recv(), Some(Frame::Text(Bytes::from_static(b"hi"))));
            assert_eq!(sub.try_recv(), Some(Frame::Binary(Bytes::from_static(b"\x00\x01"))));
        }
    }

    #[test]
    fn control_frames_are_not_relayed() {
        let hub = Hub::new(HubConfig::default());
        let mut sub = hub.attach().expect("attach");
        assert!(relay_message(Message::Ping(Bytes::new()), &hub));
        assert!(!relay_message(Message::Close(None), &hub));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn text_frames_stay_text() {
        match frame_to_message(Frame::Text(Bytes::from_static(b"{\"type\":\"pods-added\"}"))) {
            Message::Text(t) => assert_eq!(t.as_str(), "{\"type\":\"pods-added\"}"),
            other => panic!("expected text, got {other:?}"),
        }
        assert!(matches!(frame_to_message(Frame::Binary(Bytes::from_static(b"x"))), Message::Binary(_)));
    }

    #[test]
    fn outgoing_text_shares_the_encoded_buffer() {
        let encoded = Bytes::from(String::from("{\"type\":\"pods-deleted\"}"));
        let Message::Text(text) = frame_to_message(Frame::Text(encoded.clone())) else { panic!("expected text") };
        let out = Bytes::from(text);
        assert_eq!(out, encoded);
        assert_eq!(out.as_ptr(), encoded.as_ptr());
    }

    #[test]
    fn invalid_utf8_text_frame_falls_back_to_binary() {
        match frame_to_message(Frame::Text(Bytes::from_static(b"\xff\xfe"))) {
            Message::Binary(b) => assert_eq!(&b[..], b"\xff\xfe"),
            other => panic!("expected binary, got {other:?}"),
        }
    }
}
