mod orchestrator;
pub mod pipeline;
pub mod port;
mod process;
mod state;

pub use orchestrator::RecordingOrchestrator;
pub use pipeline::{InjectionTarget, PipelineDescription, RtpEndpoint};
pub use port::{PortAllocator, PortLease, PortProbe};
pub use process::{GstLauncher, RecorderLauncher, RecorderProcess};
pub use state::RecordingState;
