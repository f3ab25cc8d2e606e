use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One traversal step: an operator name plus literal arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Step {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// String arguments, in order. Non-string arguments are skipped.
    pub fn string_args(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(Value::as_str)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// Decoded, optimizer-applied graph query.
///
/// Owned by exactly one dispatch; never shared across jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traversal {
    /// Traversal source binding, `g` for the default graph.
    pub source: String,
    pub steps: Vec<Step>,
}

impl Traversal {
    pub fn new(source: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            source: source.into(),
            steps,
        }
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        for step in &self.steps {
            write!(f, ".{step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Step, Traversal};

    #[test]
    fn displays_as_call_chain() {
        let t = Traversal::new(
            "g",
            vec![
                Step::new("V", vec![]),
                Step::new("has", vec![json!("age"), json!(30)]),
            ],
        );
        assert_eq!(t.to_string(), r#"g.V().has("age",30)"#);
        assert_eq!(t.step_names(), vec!["V", "has"]);
        assert_eq!(t.last_step().map(|s| s.name.as_str()), Some("has"));
    }

    #[test]
    fn string_args_skip_literals() {
        let s = Step::new("out", vec![json!("knows"), json!(1), json!("created")]);
        assert_eq!(s.string_args().collect::<Vec<_>>(), vec!["knows", "created"]);
    }
}
