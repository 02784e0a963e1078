use crate::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use log::*;
use service::AppState;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use ws::{Inbound, Manager, Outbound};

/// WebSocket handler. Authentication happens over the socket, so the upgrade
/// itself is open to anyone while the server is accepting connections.
pub(crate) async fn ws_handler(
    State(app_state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Result<Response> {
    app_state.manager.ensure_accepting()?;

    let manager = app_state.manager.clone();
    Ok(upgrade
        .max_message_size(app_state.config.max_ws_message_size)
        .on_upgrade(move |socket| serve_socket(manager, socket)))
}

async fn serve_socket(manager: Arc<Manager>, socket: WebSocket) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Frames arrive from the manager through the channel; a close frame is
    // the last thing written.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let closing = matches!(outbound, Outbound::Close(_));
            if let Err(e) = sink.send(to_message(outbound)).await {
                debug!("WebSocket write failed: {e}");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let inbound = stream.filter_map(|frame| ready(to_inbound(frame)));
    manager.run_connection(tx, inbound).await;

    if let Err(e) = writer.await {
        warn!("WebSocket writer task failed: {e}");
    }
}

fn to_message(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Ping => Message::Ping(Vec::new()),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: reason.code,
            reason: Cow::Borrowed(reason.reason),
        })),
    }
}

/// Pings are answered by axum itself and never reach the manager.
fn to_inbound(frame: core::result::Result<Message, axum::Error>) -> Option<Inbound> {
    match frame {
        Ok(Message::Text(text)) => Some(Inbound::Text(text)),
        Ok(Message::Binary(bytes)) => Some(Inbound::Text(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        Ok(Message::Pong(_)) => Some(Inbound::Pong),
        Ok(Message::Ping(_)) => None,
        Ok(Message::Close(_)) => Some(Inbound::Close),
        Err(e) => {
            debug!("WebSocket read failed: {e}");
            Some(Inbound::Close)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ws::message::CloseReason;

    #[test]
    fn test_outbound_frames() {
        assert_eq!(
            to_message(Outbound::Text("hi".to_string())),
            Message::Text("hi".to_string())
        );
        assert_eq!(to_message(Outbound::Ping), Message::Ping(Vec::new()));

        let Message::Close(Some(frame)) = to_message(Outbound::Close(CloseReason::AUTHENTICATION_FAILED))
        else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1008);
        assert_eq!(frame.reason, "Authentication failed");
    }

    #[test]
    fn test_inbound_frames() {
        assert_eq!(
            to_inbound(Ok(Message::Text("{}".to_string()))),
            Some(Inbound::Text("{}".to_string()))
        );
        assert_eq!(
            to_inbound(Ok(Message::Binary(b"{\"token\":\"t\"}".to_vec()))),
            Some(Inbound::Text("{\"token\":\"t\"}".to_string()))
        );
        assert_eq!(to_inbound(Ok(Message::Pong(Vec::new()))), Some(Inbound::Pong));
        assert_eq!(to_inbound(Ok(Message::Ping(Vec::new()))), None);
        assert_eq!(to_inbound(Ok(Message::Close(None))), Some(Inbound::Close));
    }
}
