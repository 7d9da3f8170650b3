//! Agent RPC core: task lifecycle, delegation, JSON-RPC dispatch, and the
//! MCP-enabled helper client.

pub mod card;
pub mod delegation;
pub mod mcp_client;
pub mod rpc;
pub mod tasks;

pub use card::{AgentCapabilities, AgentCard, AgentProvider};
pub use delegation::{DelegationClient, DelegationParams};
pub use mcp_client::McpToolClient;
pub use rpc::AgentRpc;
pub use tasks::{EchoProcessor, TaskManager, TaskProcessor, TaskSubmission};
