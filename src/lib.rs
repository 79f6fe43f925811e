pub mod cache;
pub mod channel;
pub mod config;
pub mod epg;
pub mod errors;
pub mod organize;
pub mod parser;
pub mod schedule;
pub mod server;
pub mod validator;

pub use channel::{Channel, ChannelStatus};
pub use errors::{MatrixError, Result};
pub use parser::Playlist;
