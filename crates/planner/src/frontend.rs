//! Request payload decoding into [`Traversal`]s.
//!
//! Two payload forms are accepted:
//! - bytecode: JSON `{"source":"g","steps":[["V"],["has","age",30]]}` where each
//!   instruction is `[name, args...]`
//! - script: a call chain such as `g.V().has("age", P.gt(30)).out("knows")`
//!
//! Predicate calls inside arguments (`P.gt(30)`, `within(1, 2)`) decode to
//! `{"predicate": "gt", "args": [30]}`.

use gqd_common::{GqdError, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, cut_err, delimited, opt, preceded, repeat, separated, terminated};
use winnow::error::{ContextError, ErrMode, StrContext};
use winnow::token::{any, none_of, one_of, take_while};
use winnow::{ModalResult, Parser};

use crate::strategy::StrategyChain;
use crate::traversal::{Step, Traversal};

/// Primitive casts emitted by script translators, e.g. `P.gt((int) 30)`.
const STRIPPED_TYPE_CASTS: [&str; 4] = ["(int)", "(long)", "(double)", "(boolean)"];

/// Raw execute payload of an operation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytecode(Vec<u8>),
    Script(String),
}

/// Query-language front end consumed by the dispatcher.
pub trait FrontEnd: Send + Sync {
    /// Decode a payload into an executable traversal.
    fn decode(&self, payload: &Payload) -> Result<Traversal>;
    /// Apply optimizer rewrites. Must be idempotent and free of side effects.
    fn apply_optimizations(&self, traversal: Traversal) -> Result<Traversal>;
}

/// Default front end: JSON bytecode or call-chain scripts plus a [`StrategyChain`].
#[derive(Debug, Default)]
pub struct TraversalFrontEnd {
    strategies: StrategyChain,
}

impl TraversalFrontEnd {
    pub fn new() -> Self {
        Self::with_strategies(StrategyChain::new())
    }

    pub fn with_strategies(strategies: StrategyChain) -> Self {
        Self { strategies }
    }

    /// Strategy registry, for registering custom rewrites.
    pub fn strategies(&self) -> &StrategyChain {
        &self.strategies
    }
}

impl FrontEnd for TraversalFrontEnd {
    fn decode(&self, payload: &Payload) -> Result<Traversal> {
        let traversal = match payload {
            Payload::Bytecode(bytes) => decode_bytecode(bytes)?,
            Payload::Script(script) => parse_script(script)?,
        };
        if traversal.steps.is_empty() {
            return Err(GqdError::Planning("traversal has no steps".to_string()));
        }
        Ok(traversal)
    }

    fn apply_optimizations(&self, traversal: Traversal) -> Result<Traversal> {
        self.strategies.apply(traversal)
    }
}

#[derive(Debug, Deserialize)]
struct BytecodeDoc {
    #[serde(default = "default_source")]
    source: String,
    steps: Vec<Vec<Value>>,
}

fn default_source() -> String {
    "g".to_string()
}

/// Decode the JSON bytecode form.
pub fn decode_bytecode(bytes: &[u8]) -> Result<Traversal> {
    let doc: BytecodeDoc = serde_json::from_slice(bytes)
        .map_err(|e| GqdError::Planning(format!("bytecode decode failed: {e}")))?;
    let steps = doc
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, mut instruction)| {
            if instruction.is_empty() {
                return Err(GqdError::Planning(format!("instruction {i} is empty")));
            }
            match instruction.remove(0) {
                Value::String(name) => Ok(Step::new(name, instruction)),
                other => Err(GqdError::Planning(format!(
                    "instruction {i} must start with an operator name, found {other}"
                ))),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Traversal::new(doc.source, steps))
}

/// Parse a call-chain script after removing primitive type casts.
pub fn parse_script(script: &str) -> Result<Traversal> {
    let mut cleaned = script.to_string();
    for cast in STRIPPED_TYPE_CASTS {
        cleaned = cleaned.replace(cast, "");
    }
    let result = terminated(chain, multispace0)
        .parse(cleaned.as_str())
        .map_err(|e| {
            GqdError::Planning(format!(
                "script parse error at offset {}: {}",
                e.offset(),
                e.inner()
            ))
        });
    result
}

/// `source(.step(args))*`
fn chain(input: &mut &str) -> ModalResult<Traversal> {
    let source = preceded(multispace0, ident)
        .context(StrContext::Label("traversal source"))
        .parse_next(input)?;
    let steps: Vec<Step> = repeat(
        0..,
        preceded((multispace0, '.', multispace0), cut_err(step)),
    )
    .parse_next(input)?;
    Ok(Traversal::new(source, steps))
}

fn step(input: &mut &str) -> ModalResult<Step> {
    (ident, preceded(multispace0, call_args))
        .map(|(name, args)| Step::new(name, args))
        .context(StrContext::Label("step"))
        .parse_next(input)
}

fn call_args(input: &mut &str) -> ModalResult<Vec<Value>> {
    preceded(
        '(',
        cut_err(terminated(
            separated(0.., delimited(multispace0, arg, multispace0), ','),
            (multispace0, ')'),
        )),
    )
    .context(StrContext::Label("argument list"))
    .parse_next(input)
}

fn arg(input: &mut &str) -> ModalResult<Value> {
    alt((string.map(Value::String), number, word)).parse_next(input)
}

/// Keyword literal, `T.label` style token, or `P.gt(..)` style predicate call.
/// Qualifiers collapse to the last segment.
fn word(input: &mut &str) -> ModalResult<Value> {
    let first = ident.parse_next(input)?;
    let qualified: Vec<&str> = repeat(0.., preceded('.', ident)).parse_next(input)?;
    let name = qualified.last().copied().unwrap_or(first);
    let args = opt(preceded(multispace0, call_args)).parse_next(input)?;
    Ok(match (args, qualified.is_empty(), first) {
        (Some(args), _, _) => json!({ "predicate": name, "args": args }),
        (None, true, "true") => Value::Bool(true),
        (None, true, "false") => Value::Bool(false),
        (None, true, "null") => Value::Null,
        (None, _, _) => json!({ "token": name }),
    })
}

fn string(input: &mut &str) -> ModalResult<String> {
    alt((quoted('"'), quoted('\''))).parse_next(input)
}

fn quoted<'i>(quote: char) -> impl Parser<&'i str, String, ErrMode<ContextError>> {
    preceded(
        quote,
        cut_err(terminated(
            repeat(0.., alt((escaped_char, none_of([quote, '\\'])))),
            quote,
        )),
    )
    .context(StrContext::Label("string literal"))
}

fn escaped_char(input: &mut &str) -> ModalResult<char> {
    preceded('\\', any)
        .map(|c: char| match c {
            'n' => '\n',
            't' => '\t',
            other => other,
        })
        .parse_next(input)
}

/// Integer or decimal literal. Numeric suffixes (`30L`, `1.5d`, `2f`) are dropped.
fn number(input: &mut &str) -> ModalResult<Value> {
    let value = (
        opt('-'),
        digit1,
        opt(('.', digit1)),
        opt((one_of(['e', 'E']), opt(one_of(['+', '-'])), digit1)),
    )
        .take()
        .try_map(|literal: &str| serde_json::from_str::<Value>(literal))
        .context(StrContext::Label("number"))
        .parse_next(input)?;
    opt(one_of(['L', 'l', 'd', 'D', 'f', 'F']))
        .void()
        .parse_next(input)?;
    Ok(value)
}

fn ident<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| c.is_alphanumeric() || c == '_').parse_next(input)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_call_chain_with_predicates_and_casts() {
        let t = parse_script(r#"g.V().has("age", P.gt((int) 30)).out('knows').limit(2L)"#)
            .expect("parse");
        assert_eq!(t.source, "g");
        assert_eq!(t.step_names(), vec!["V", "has", "out", "limit"]);
        assert_eq!(
            t.steps[1].args,
            vec![json!("age"), json!({"predicate": "gt", "args": [30]})]
        );
        assert_eq!(t.steps[2].args, vec![json!("knows")]);
        assert_eq!(t.steps[3].args, vec![json!(2)]);
    }

    #[test]
    fn parses_tokens_and_literals() {
        let t = parse_script("g.V(1, -2.5, true, null).values(T.label)").expect("parse");
        assert_eq!(
            t.steps[0].args,
            vec![json!(1), json!(-2.5), json!(true), Value::Null]
        );
        assert_eq!(t.steps[1].args, vec![json!({"token": "label"})]);
    }

    #[test]
    fn parses_escapes_nested_predicates_and_whitespace() {
        let t = parse_script(
            " g . V ( ) .has( 'name' , within( \"mar\\\"ko\" , 'it\\'s' ) ) .range(0, 1.5e1d) ",
        )
        .expect("parse");
        assert_eq!(t.step_names(), vec!["V", "has", "range"]);
        assert_eq!(
            t.steps[1].args,
            vec![
                json!("name"),
                json!({"predicate": "within", "args": ["mar\"ko", "it's"]})
            ]
        );
        assert_eq!(t.steps[2].args, vec![json!(0), json!(15.0)]);
    }

    #[test]
    fn parse_errors_report_offset() {
        let err = parse_script("g.V().has('a',)").expect_err("trailing comma");
        assert!(matches!(err, GqdError::Planning(_)));
        assert!(err.to_string().contains("offset"), "{err}");
        assert!(parse_script("g.V().has('open").is_err());
    }

    #[test]
    fn rejects_malformed_scripts() {
        for bad in ["g.V(", "g.V().has(\"a\"", "g..V()", "g.V() extra", "g.V().has(@)"] {
            let err = parse_script(bad).expect_err(bad);
            assert!(matches!(err, GqdError::Planning(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn decodes_bytecode_json() {
        let t = decode_bytecode(br#"{"steps":[["V"],["hasLabel","person"],["count"]]}"#)
            .expect("decode");
        assert_eq!(t.source, "g");
        assert_eq!(t.step_names(), vec!["V", "hasLabel", "count"]);
        assert_eq!(t.steps[1].args, vec![json!("person")]);
    }

    #[test]
    fn bytecode_instruction_must_start_with_name() {
        let err = decode_bytecode(br#"{"steps":[[1, 2]]}"#).expect_err("numeric op");
        assert!(err.to_string().contains("instruction 0"));
        let err = decode_bytecode(br#"{"steps":[[]]}"#).expect_err("empty op");
        assert!(err.to_string().contains("empty"));
        assert!(decode_bytecode(b"not json").is_err());
    }

    #[test]
    fn front_end_rejects_traversal_without_steps() {
        let fe = TraversalFrontEnd::new();
        let err = fe
            .decode(&Payload::Script("g".to_string()))
            .expect_err("no steps");
        assert!(err.to_string().contains("no steps"));
    }
}
