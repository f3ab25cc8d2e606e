//! Distributed job dispatch: from a client operation to a streamed cluster job.
//!
//! Architecture role:
//! - [`processor`]: per-request pipeline orchestration ([`DispatchOpProcessor`])
//! - [`compiler`]: traversal to physical-plan lowering ([`IrPlanCompiler`])
//! - [`job`]: job descriptor assembly ([`JobDescriptorBuilder`])
//! - [`broadcast`]: multi-endpoint submission and sink registry ([`ClusterBroadcaster`])
//! - [`sink`]: per-job result consumption ([`ResultSink`])
//! - [`channel`] / [`grpc`]: cluster transport
//! - [`session`]: client response contract

pub mod broadcast;
pub mod channel;
pub mod compiler;
pub mod grpc;
pub mod job;
pub mod processor;
pub mod session;
pub mod sink;

pub use broadcast::{ClusterBroadcaster, JobHandle};
pub use channel::{ClusterChannel, InProcessChannel, ResultStream};
pub use compiler::IrPlanCompiler;
pub use grpc::GrpcClusterChannel;
pub use job::{JobDescriptor, JobDescriptorBuilder};
pub use processor::{Collaborators, DispatchOpProcessor, OpRequest, Operation, OP_BYTECODE, OP_EVAL};
pub use session::{ChannelSession, ResponseMessage, ResponseStatus, Session};
pub use sink::{
    FixtureProperties, ResultEnricher, ResultSink, SinkEvent, SinkOutcome, SinkState,
};
