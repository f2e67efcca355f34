pub mod assembler;
pub mod bridge;
pub mod bus;
pub mod chain;
pub mod container;
pub mod environment;
pub mod handlers;
pub mod session;

#[cfg(test)]
mod testing;

pub use assembler::Assembler;
pub use bridge::{DriverBridge, HistorySource};
pub use bus::{BusConsumer, SystemBus};
pub use chain::{HandlerOutput, MessageHandler, MessageHandlerChain};
pub use container::{AgentInfo, Container};
pub use environment::{
    ChannelEffector, ChannelLink, ChannelReceptor, EchoGuard, Effector, Receptor, RelayFilter, SdkReceptor,
};
pub use handlers::{ResultHandler, StreamEventHandler, ToolResultHandler};
pub use session::Session;
