pub mod attempts;
pub mod backend;
pub mod client;
pub mod lockout;
pub mod protocol;
pub mod server;
pub mod stats;

pub use attempts::{AttemptRegistry, AttemptSettings};
pub use backend::{select_backend, AuthBackend, FallbackBackend, LocalBackend, RemoteBackend};
pub use client::IpcClient;
pub use lockout::LockoutTracker;
pub use server::{AccessPolicy, IpcServer, ServerOptions, ShutdownHandle};
pub use stats::{DaemonStats, StatsRegistry};
