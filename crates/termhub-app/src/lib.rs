// termhub: project terminals over a JSON frame protocol
pub mod config;
pub mod connection;
pub mod logging;
pub mod protocol;

pub use config::{AppConfig, Cli, Commands};
pub use connection::{CloseReason, TerminalConnection};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
