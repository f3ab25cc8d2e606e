//! Traversal model and the collaborator contracts consumed by the dispatcher.
//!
//! Key modules:
//! - [`traversal`]: in-memory query representation
//! - [`frontend`]: payload decoding ([`FrontEnd`])
//! - [`strategy`]: idempotent traversal rewrites
//! - [`meta`]: schema snapshot and [`MetaFetcher`]
//! - [`result`]: result frame decoding ([`ResultAnalyzer`], [`ResultParser`])

pub mod frontend;
pub mod meta;
pub mod result;
pub mod strategy;
pub mod traversal;

pub use frontend::{FrontEnd, Payload, TraversalFrontEnd};
pub use meta::{FileMetaFetcher, GraphSchema, MetaFetcher, SharedSchema};
pub use result::{DefaultResultAnalyzer, JsonResultParser, ResultAnalyzer, ResultParser, ResultShape};
pub use strategy::{StrategyChain, TraversalStrategy};
pub use traversal::{Step, Traversal};

use gqd_common::Result;

/// Lowers a traversal into an opaque physical-plan buffer.
///
/// Fails with [`gqd_common::GqdError::Compile`] for unsupported traversal shapes.
pub trait PlanCompiler: Send + Sync {
    fn compile(&self, traversal: &Traversal) -> Result<Vec<u8>>;
}
