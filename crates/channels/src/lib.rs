pub mod ack;
pub mod channel;
pub mod protocol;
pub mod server;
pub mod ws;

pub use ack::{AckCallback, AckOptions, AckTracker};
pub use channel::{Channel, ConnectionState};
pub use protocol::WireFrame;
pub use server::{ChannelServer, ServerChannel, ServerState, WebSocketChannelServer};
pub use ws::WebSocketChannel;
