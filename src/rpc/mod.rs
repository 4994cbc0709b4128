//! Request/response/notification messaging over one duplex connection,
//! identical on the accepting and the initiating side.

mod channel;
pub mod message;

pub use channel::{frames, Responder, RpcChannel, RpcHandler};
pub use message::Frame;
