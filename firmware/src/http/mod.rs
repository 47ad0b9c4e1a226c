pub mod handlers;
pub mod parser;
pub mod pipeline;

pub use parser::{Method, Request};
pub use pipeline::{HandlerChain, HandlerResult, HttpHandler, HttpState, ResponsePhase};
