//! IR plan compiler.
//!
//! Lowers a [`Traversal`] into an encoded [`v1::JobRequest`] whose `plan` is
//! the JSON operator list and whose `source` is the traversal source binding.
//! Label arguments are validated against the schema published by the most
//! recent metadata refresh.

use gqd_common::{GqdError, Result};
use gqd_planner::{GraphSchema, PlanCompiler, SharedSchema, Step, Traversal};
use prost::Message;
use tracing::debug;

use crate::grpc::v1;

/// Operators the cluster executor understands.
pub const SUPPORTED_OPERATORS: &[&str] = &[
    "V", "E", "has", "hasLabel", "hasId", "hasNot", "out", "in", "both", "outE", "inE",
    "bothE", "outV", "inV", "otherV", "values", "valueMap", "id", "label", "limit", "range",
    "dedup", "count", "sum", "max", "min", "mean", "order", "by", "as", "select", "where",
    "path", "fold", "unfold",
];

const EDGE_LABEL_STEPS: [&str; 6] = ["out", "in", "both", "outE", "inE", "bothE"];

#[derive(Debug, Clone)]
pub struct IrPlanCompiler {
    schema: SharedSchema,
}

impl IrPlanCompiler {
    pub fn new(schema: SharedSchema) -> Self {
        Self { schema }
    }

    fn check_step(schema: &GraphSchema, step: &Step) -> Result<()> {
        if !SUPPORTED_OPERATORS.contains(&step.name.as_str()) {
            return Err(GqdError::Compile(format!(
                "operator `{}` is not supported",
                step.name
            )));
        }
        if step.name == "hasLabel" {
            for label in step.string_args() {
                if !schema.has_vertex_label(label) && !schema.has_edge_label(label) {
                    return Err(GqdError::Compile(format!("unknown label `{label}`")));
                }
            }
        } else if EDGE_LABEL_STEPS.contains(&step.name.as_str()) {
            for label in step.string_args() {
                if !schema.has_edge_label(label) {
                    return Err(GqdError::Compile(format!(
                        "unknown edge label `{label}` in {step}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl PlanCompiler for IrPlanCompiler {
    fn compile(&self, traversal: &Traversal) -> Result<Vec<u8>> {
        let schema = self
            .schema
            .current()
            .ok_or_else(|| GqdError::Compile("no graph schema loaded".to_string()))?;
        for step in &traversal.steps {
            Self::check_step(&schema, step)?;
        }
        let plan = serde_json::to_vec(&traversal.steps)
            .map_err(|e| GqdError::Compile(format!("plan encode failed: {e}")))?;
        debug!(operators = traversal.steps.len(), plan_bytes = plan.len(), "traversal compiled");
        Ok(v1::JobRequest {
            conf: None,
            source: traversal.source.as_bytes().to_vec(),
            plan,
            resource: Vec::new(),
        }
        .encode_to_vec())
    }
}
