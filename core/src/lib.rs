pub mod bridge;
pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod interpreter;
pub mod refs;
pub mod server;
pub mod service;
pub mod session;

// Re-export main types
pub use bridge::{Bridge, Dispatcher, SubmitOptions};
pub use config::Config;
pub use errors::{BridgeError, EvalError, InteropError, InteropResult};
pub use events::{AsyncEvent, FrameInfo};
pub use refs::{Handle, Reference};
pub use service::InteropService;
pub use session::{Breakpoint, DebugCommand, ReplState};
