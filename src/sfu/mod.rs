mod injected_source;
mod peer;
mod registry;
mod server;
pub mod signaling;

pub use injected_source::InjectedSource;
pub use peer::{Peer, PeerDetails, PeerKind, PeerMedia, PeerProfile};
pub use registry::SessionRegistry;
pub use server::SfuServer;
pub use signaling::SignalingHandler;
