//! Ports (hexagonal architecture boundaries).

pub mod outbound;

pub use outbound::{
    AllowAll, Authorizer, AuthorizeFault, ChannelFunction, CloseHandle, FrameSink,
    FunctionError, FunctionHandler, FunctionInstaller, QueryExecutor, StreamBody, StreamHandler,
    StreamRequest, UpstreamClient,
};
