pub mod codec;
pub mod connection;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

pub use connection::ConnectParams;
pub use registry::{ConnectionRegistry, ConnectionState};
pub use router::{CommandHandler, CommandRouter, RequestScope};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
