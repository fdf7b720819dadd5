//! Builtin nodes — the in-process units of work the dispatcher and the chat
//! controller invoke. Nodes communicate through the blackboard and honour
//! the abort signal at their suspension points.

mod data_ingest;
mod data_query;
mod echo;
mod file_parser;
mod http_request;
mod search;
mod writer;

pub use data_ingest::DataIngestNode;
pub use data_query::DataQueryNode;
pub use echo::EchoNode;
pub use file_parser::FileParserNode;
pub use http_request::HttpRequestNode;
pub use search::SearchNode;
pub use writer::WriterNode;

use std::sync::Arc;

use tempo_clients::{LlmClient, TongluClient};
use tempo_kernel::NodeRegistry;

/// Register every builtin node. Called once at startup; the registry is
/// immutable for builtins afterwards.
pub fn register_builtin_nodes(
    registry: &NodeRegistry,
    llm: Arc<LlmClient>,
    tonglu: Arc<TongluClient>,
) {
    registry.register_builtin(Arc::new(EchoNode));
    registry.register_builtin(Arc::new(HttpRequestNode::new()));
    registry.register_builtin(Arc::new(SearchNode::new(llm.clone())));
    registry.register_builtin(Arc::new(WriterNode::new(llm)));
    registry.register_builtin(Arc::new(DataQueryNode::new(tonglu.clone())));
    registry.register_builtin(Arc::new(DataIngestNode::new(tonglu.clone())));
    registry.register_builtin(Arc::new(FileParserNode::new(tonglu)));
}
