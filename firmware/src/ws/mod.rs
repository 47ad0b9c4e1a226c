pub mod frame;
pub mod registry;

pub use frame::{Opcode, WsFrame};
pub use registry::{WsConnState, WsProtocolHandler, WsRegistry};
