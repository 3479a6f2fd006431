//! Stagewright external-tool client adapter.
//!
//! Implements the [`pipeline::tools::ToolConnector`] and
//! [`pipeline::tools::ToolChannel`] traits over JSON-RPC 2.0. Each channel
//! performs the `initialize` handshake when opened and issues one
//! `tools/call` request per tool invocation.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Protocol framing, transport selection, handshake, and
//! process management live here. The [`pipeline`] crate sees only the port
//! traits and the raw `{content, isError}` envelope.
//!
//! ## Transport
//!
//! Transport is selected by [`pipeline::tools::ConnectionParams`]:
//!
//! - `Stdio`: spawn the configured command and exchange newline-delimited
//!   JSON on its stdin/stdout (default). The child is killed when the channel
//!   closes or is dropped.
//! - `Http`: POST each request to the configured URL.

mod connector;
mod http;
mod rpc;
mod stdio;

pub use connector::{ChannelTimeouts, ExtensionConnector};
pub use http::HttpChannel;
pub use stdio::StdioChannel;
