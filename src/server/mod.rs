pub mod backend;
pub mod port;
pub mod registry;
pub mod supervisor;

pub use backend::{Backend, LaunchSpec};
pub use registry::{ServerInstance, ServerRegistry, ServerState};
pub use supervisor::ProcessSupervisor;
