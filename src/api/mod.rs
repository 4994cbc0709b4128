pub mod sfu_routes;
pub mod sfu_websocket;
