use std::sync::Arc;

use serde_json::json;
use warp::Filter;

use super::sfu_websocket;
use crate::sfu::SfuServer;

/// Every route the server exposes.
pub fn routes(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    sfu_websocket_route(sfu_server.clone()).or(sfu_health_check(sfu_server))
}

/// Signaling WebSocket, served at the root path.
pub fn sfu_websocket_route(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path::end()
        .and(warp::ws())
        .and(with_sfu_server(sfu_server))
        .map(|ws: warp::ws::Ws, sfu_server: Arc<SfuServer>| {
            ws.on_upgrade(move |websocket| sfu_websocket::handle_sfu_websocket(websocket, sfu_server))
        })
}

pub fn sfu_health_check(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_sfu_server(sfu_server))
        .and_then(|sfu_server: Arc<SfuServer>| async move {
            let peers = sfu_server.registry().len().await;
            let recording = sfu_server.recording().state().await;

            Ok::<_, warp::Rejection>(warp::reply::json(&json!({
                "status": "healthy",
                "service": "groupcall-sfu",
                "version": env!("CARGO_PKG_VERSION"),
                "peers": peers,
                "recording": recording
            })))
        })
}

fn with_sfu_server(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = (Arc<SfuServer>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || sfu_server.clone())
}
