//! MCP proxy: JSON-RPC protocol types, upstream connections, supervision,
//! and the policy-gated router.

pub mod protocol;
pub mod router;
pub mod supervisor;
pub mod upstream;

pub use protocol::{
    prefixed_tool, split_prefixed_tool, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpHeaders,
};
pub use router::{McpRouter, DEFAULT_REQUEST_TIMEOUT};
pub use upstream::{load_upstreams, Transport, UpstreamConfig, UpstreamHandle, UpstreamsFile};
