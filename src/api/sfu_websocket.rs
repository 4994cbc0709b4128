use std::sync::Arc;

use futures::{future, SinkExt, StreamExt};
use warp::ws::{Message, WebSocket};

use crate::rpc::RpcChannel;
use crate::sfu::SfuServer;

/// Drives one client connection: text frames in, the channel's frames out.
/// Binary frames are ignored; a close frame or socket error ends the session.
pub async fn handle_sfu_websocket(websocket: WebSocket, sfu_server: Arc<SfuServer>) {
    let (mut ws_sender, ws_receiver) = websocket.split();
    let (channel, mut outbound) = RpcChannel::new();
    let handler = sfu_server.connect(channel.clone());
    let peer_id = handler.peer().id().to_string();

    tracing::info!(peer_id = %peer_id, "WebSocket connection established");

    // Spawn task to send messages to client
    let sender_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = ws_sender.send(Message::text(text)).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    let incoming = ws_receiver
        .take_while(|result| {
            let open = match result {
                Ok(message) => !message.is_close(),
                Err(e) => {
                    tracing::error!(error = %e, "WebSocket error");
                    false
                }
            };
            future::ready(open)
        })
        .filter_map(|result| {
            let text = result
                .ok()
                .and_then(|message| message.to_str().ok().map(str::to_owned));
            future::ready(text)
        });

    channel.run(incoming, handler).await;

    sender_task.abort();
    tracing::info!(peer_id = %peer_id, "WebSocket connection closed");
}
