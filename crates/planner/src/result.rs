use std::sync::Arc;

use gqd_common::{GqdError, Result};
use serde_json::Value;

use crate::traversal::Traversal;

/// Steps whose output is a plain value or a list of plain values.
const SCALAR_STEPS: [&str; 9] = [
    "count", "sum", "max", "min", "mean", "values", "id", "label", "fold",
];

/// Steps that emit vertices or edges.
const ELEMENT_STEPS: [&str; 11] = [
    "V", "E", "out", "in", "both", "outE", "inE", "bothE", "outV", "inV", "otherV",
];

/// Steps that emit property maps or paths.
const MAP_STEPS: [&str; 2] = ["valueMap", "path"];

/// Filters, modulators and ordering: the output shape is that of the previous step.
const SHAPE_PRESERVING_STEPS: [&str; 11] = [
    "limit", "range", "dedup", "order", "by", "as", "where", "has", "hasLabel", "hasId",
    "hasNot",
];

/// Decodes one raw result frame into client-visible values.
pub trait ResultParser: Send + Sync {
    fn parse(&self, frame: &[u8]) -> Result<Vec<Value>>;
}

/// Chooses the [`ResultParser`] for a traversal.
pub trait ResultAnalyzer: Send + Sync {
    fn analyze(&self, traversal: &Traversal) -> Result<Arc<dyn ResultParser>>;
}

/// Expected shape of every value in a result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// JSON objects describing vertices, edges or paths.
    Elements,
    /// Numbers, strings, booleans or lists of them.
    Scalars,
    /// JSON objects keyed by property name or path position.
    Maps,
    /// Shape is only known at run time, e.g. `select`.
    Any,
}

impl ResultShape {
    fn admits(self, value: &Value) -> bool {
        match self {
            ResultShape::Elements | ResultShape::Maps => value.is_object(),
            ResultShape::Scalars => !value.is_object(),
            ResultShape::Any => true,
        }
    }
}

/// Frames are a JSON array of values or a single JSON value.
#[derive(Debug, Clone, Copy)]
pub struct JsonResultParser {
    shape: ResultShape,
}

impl JsonResultParser {
    pub fn new(shape: ResultShape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }
}

impl ResultParser for JsonResultParser {
    fn parse(&self, frame: &[u8]) -> Result<Vec<Value>> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }
        let decoded: Value = serde_json::from_slice(frame)
            .map_err(|e| GqdError::Execution(format!("result frame decode failed: {e}")))?;
        let values = match decoded {
            Value::Array(items) => items,
            other => vec![other],
        };
        if let Some(bad) = values.iter().find(|v| !self.shape.admits(v)) {
            return Err(GqdError::Execution(format!(
                "result value {bad} does not match expected {:?} shape",
                self.shape
            )));
        }
        Ok(values)
    }
}

#[derive(Debug, Default)]
pub struct DefaultResultAnalyzer;

impl DefaultResultAnalyzer {
    /// Walks back from the last step until one that determines the shape.
    ///
    /// Each `unfold` cancels the nearest earlier `fold`, so `fold().unfold()`
    /// keeps the shape of whatever was folded.
    pub fn shape_of(traversal: &Traversal) -> ResultShape {
        let mut pending_unfolds = 0usize;
        for step in traversal.steps.iter().rev() {
            let name = step.name.as_str();
            if name == "unfold" {
                pending_unfolds += 1;
            } else if name == "fold" && pending_unfolds > 0 {
                pending_unfolds -= 1;
            } else if SHAPE_PRESERVING_STEPS.contains(&name) {
                continue;
            } else if SCALAR_STEPS.contains(&name) {
                return ResultShape::Scalars;
            } else if ELEMENT_STEPS.contains(&name) {
                return ResultShape::Elements;
            } else if MAP_STEPS.contains(&name) {
                return ResultShape::Maps;
            } else {
                return ResultShape::Any;
            }
        }
        ResultShape::Any
    }
}

impl ResultAnalyzer for DefaultResultAnalyzer {
    fn analyze(&self, traversal: &Traversal) -> Result<Arc<dyn ResultParser>> {
        Ok(Arc::new(JsonResultParser::new(Self::shape_of(traversal))))
    }
}
