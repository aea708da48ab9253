//! Functional nodes: argument references, constants and transform blocks
//!
//! Transform blocks are evaluated column-wise over one batch of rows. Every
//! input resolves to a column of the batch length; single-value constants are
//! broadcast, anything else of the wrong length is an [`ArityError`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use genflow_common::Value;

use crate::error::{ArityError, EngineError, TransformError};

/// One column of a batch
pub type Column = Vec<Value>;

/// Batch-wise transform function: input columns in, output columns out
pub type TransformFn = Arc<dyn Fn(&[Column]) -> anyhow::Result<Vec<Column>> + Send + Sync>;

/// Reference to a value available while processing a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Output column of the generator's extraction
    Query(String),
    /// Literal sequence; a single value is broadcast to every row
    Const(Vec<Value>),
    /// Named output of an earlier transform block
    Block { block: String, output: String },
    /// Surrogate key computed by another load of the same generator
    Key(String),
}

impl Arg {
    pub fn query(name: impl Into<String>) -> Self {
        Arg::Query(name.into())
    }

    /// Single constant broadcast to every row
    pub fn value(value: impl Into<Value>) -> Self {
        Arg::Const(vec![value.into()])
    }

    pub fn values<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Arg::Const(values.into_iter().map(Into::into).collect())
    }

    pub fn key(load: impl Into<String>) -> Self {
        Arg::Key(load.into())
    }

    /// Like the `Display` form, but constants spell out their values
    pub fn signature(&self) -> String {
        match self {
            Arg::Const(values) => format!(
                "const[{}]",
                values.iter().map(Value::to_string).collect::<Vec<_>>().join(",")
            ),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Query(name) => write!(f, "query.{}", name),
            Arg::Const(values) => write!(f, "const[{}]", values.len()),
            Arg::Block { block, output } => write!(f, "{}.{}", block, output),
            Arg::Key(load) => write!(f, "key({})", load),
        }
    }
}

/// Named pure function with declared inputs and outputs.
///
/// The function may be called more than once for the same batch and must
/// depend only on its inputs.
#[derive(Clone)]
pub struct TransformBlock {
    pub name: String,
    pub inputs: Vec<Arg>,
    pub outputs: Vec<String>,
    func: TransformFn,
}

impl fmt::Debug for TransformBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformBlock")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl TransformBlock {
    /// Block whose function maps whole input columns to whole output columns
    pub fn new<S, F>(name: impl Into<String>, inputs: Vec<Arg>, outputs: impl IntoIterator<Item = S>, func: F) -> Self
    where
        S: Into<String>,
        F: Fn(&[Column]) -> anyhow::Result<Vec<Column>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs,
            outputs: outputs.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
        }
    }

    /// Block whose function maps one row of inputs to one row of outputs
    pub fn row_wise<S, F>(name: impl Into<String>, inputs: Vec<Arg>, outputs: impl IntoIterator<Item = S>, func: F) -> Self
    where
        S: Into<String>,
        F: Fn(&[Value]) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        let outputs: Vec<String> = outputs.into_iter().map(Into::into).collect();
        let width = outputs.len();
        Self::new(name, inputs, outputs, move |columns: &[Column]| {
            let len = columns.first().map(Vec::len).unwrap_or(0);
            let mut out: Vec<Column> = (0..width).map(|_| Vec::with_capacity(len)).collect();
            let mut row = Vec::with_capacity(columns.len());
            for i in 0..len {
                row.clear();
                row.extend(columns.iter().map(|c| c[i].clone()));
                let values = func(&row)?;
                if values.len() != width {
                    anyhow::bail!("row {} produced {} values, expected {}", i, values.len(), width);
                }
                for (column, value) in out.iter_mut().zip(values) {
                    column.push(value);
                }
            }
            Ok(out)
        })
    }

    /// Reference to one of this block's outputs
    pub fn output(&self, name: &str) -> Arg {
        Arg::Block {
            block: self.name.clone(),
            output: name.to_string(),
        }
    }

    /// Stable textual signature, part of the generator fingerprint
    pub fn signature(&self) -> String {
        let inputs: Vec<String> = self.inputs.iter().map(Arg::signature).collect();
        format!("{}({}) -> ({})", self.name, inputs.join(", "), self.outputs.join(", "))
    }
}

/// Values available while processing one batch
#[derive(Debug, Clone, Default)]
pub struct Frame {
    len: usize,
    query: HashMap<String, Column>,
    blocks: HashMap<(String, String), Column>,
    keys: HashMap<String, Column>,
}

impl Frame {
    /// Frame over extracted rows, columns named by `outputs`
    pub fn from_rows(outputs: &[String], rows: Vec<Vec<Value>>) -> Self {
        let len = rows.len();
        let mut columns: Vec<Column> = outputs.iter().map(|_| Vec::with_capacity(len)).collect();
        for row in rows {
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        Self {
            len,
            query: outputs.iter().cloned().zip(columns).collect(),
            blocks: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Frame with no extracted columns
    pub fn empty(len: usize) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn query_column(&self, name: &str) -> Option<&Column> {
        self.query.get(name)
    }

    pub fn block_column(&self, block: &str, output: &str) -> Option<&Column> {
        self.blocks.get(&(block.to_string(), output.to_string()))
    }

    pub fn set_keys(&mut self, load: &str, keys: Column) {
        self.keys.insert(load.to_string(), keys);
    }

    /// Resolve `arg` to a column of the frame length.
    ///
    /// `node` names the consumer for error messages.
    pub fn resolve(&self, arg: &Arg, generator: &str, node: &str) -> Result<Column, ArityError> {
        let arity = |detail: String| ArityError {
            generator: generator.to_string(),
            node: node.to_string(),
            detail,
        };
        let column = match arg {
            Arg::Const(values) if values.len() == 1 => return Ok(vec![values[0].clone(); self.len]),
            Arg::Const(values) => values,
            Arg::Query(name) => self
                .query
                .get(name)
                .ok_or_else(|| arity(format!("extraction has no output '{}'", name)))?,
            Arg::Block { block, output } => self
                .blocks
                .get(&(block.clone(), output.clone()))
                .ok_or_else(|| arity(format!("'{}.{}' has not been computed", block, output)))?,
            Arg::Key(load) => self
                .keys
                .get(load)
                .ok_or_else(|| arity(format!("keys of load '{}' have not been computed", load)))?,
        };
        if column.len() != self.len {
            return Err(arity(format!(
                "input {} has {} values but the batch has {} rows",
                arg,
                column.len(),
                self.len
            )));
        }
        Ok(column.clone())
    }

    /// Run `block` over the frame and store its outputs
    pub fn apply(&mut self, block: &TransformBlock, generator: &str) -> Result<(), NodeError> {
        let inputs = block
            .inputs
            .iter()
            .map(|arg| self.resolve(arg, generator, &block.name))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = (block.func)(&inputs).map_err(|e| TransformError {
            generator: generator.to_string(),
            block: block.name.clone(),
            message: format!("{:#}", e),
        })?;

        if outputs.len() != block.outputs.len() {
            return Err(ArityError {
                generator: generator.to_string(),
                node: block.name.clone(),
                detail: format!(
                    "returned {} columns, {} outputs declared",
                    outputs.len(),
                    block.outputs.len()
                ),
            }
            .into());
        }
        for (name, column) in block.outputs.iter().zip(outputs) {
            if column.len() != self.len {
                return Err(ArityError {
                    generator: generator.to_string(),
                    node: block.name.clone(),
                    detail: format!(
                        "output '{}' has {} values but the batch has {} rows",
                        name,
                        column.len(),
                        self.len
                    ),
                }
                .into());
            }
            self.blocks.insert((block.name.clone(), name.clone()), column);
        }
        Ok(())
    }
}

/// Failure while evaluating a node
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Arity(#[from] ArityError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl From<NodeError> for EngineError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Arity(e) => EngineError::Arity(e),
            NodeError::Transform(e) => EngineError::Transform(e),
        }
    }
}

/// Batch length for a generator without extraction: the common length of
/// its non-singleton constants, or 1 when every constant is a singleton.
pub fn constant_batch_len<'a>(
    generator: &str,
    args: impl IntoIterator<Item = (&'a str, &'a Arg)>,
) -> Result<usize, ArityError> {
    let mut found: Option<(usize, &str)> = None;
    for (node, arg) in args {
        if let Arg::Const(values) = arg {
            if values.len() == 1 {
                continue;
            }
            match found {
                None => found = Some((values.len(), node)),
                Some((len, first)) if len != values.len() => {
                    return Err(ArityError {
                        generator: generator.to_string(),
                        node: node.to_string(),
                        detail: format!(
                            "constant of length {} disagrees with length {} used by '{}'",
                            values.len(),
                            len,
                            first
                        ),
                    })
                },
                Some(_) => {},
            }
        }
    }
    Ok(found.map(|(len, _)| len).unwrap_or(1))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn doubler() -> TransformBlock {
        TransformBlock::row_wise("double", vec![Arg::query("x")], ["y"], |row| {
            Ok(vec![Value::Int(row[0].as_i64().unwrap_or(0) * 2)])
        })
    }

    #[test]
    fn test_row_wise_block() {
        let mut frame = Frame::from_rows(&["x".to_string()], vec![vec![Value::Int(1)], vec![Value::Int(4)]]);
        let block = doubler();
        frame.apply(&block, "gen").unwrap();
        assert_eq!(
            frame.block_column("double", "y").unwrap(),
            &vec![Value::Int(2), Value::Int(8)]
        );
    }

    #[test]
    fn test_singleton_constant_broadcasts() {
        let frame = Frame::empty(3);
        let column = frame.resolve(&Arg::value("a"), "gen", "node").unwrap();
        assert_eq!(column, vec![Value::Text("a".into()); 3]);
    }

    #[test]
    fn test_misaligned_inputs_name_block_and_generator() {
        let mut frame = Frame::from_rows(&["x".to_string()], vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        let block = TransformBlock::new(
            "zip",
            vec![Arg::query("x"), Arg::values([1, 2, 3])],
            ["out"],
            |cols| Ok(vec![cols[0].clone()]),
        );
        let err = frame.apply(&block, "pairs").unwrap_err();
        match err {
            NodeError::Arity(e) => {
                assert_eq!(e.generator, "pairs");
                assert_eq!(e.node, "zip");
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_short_output_is_an_arity_error() {
        let mut frame = Frame::empty(2);
        let block = TransformBlock::new("short", vec![], ["out"], |_| Ok(vec![vec![Value::Int(1)]]));
        assert!(matches!(frame.apply(&block, "g"), Err(NodeError::Arity(_))));
    }

    #[test]
    fn test_failing_function_is_a_transform_error() {
        let mut frame = Frame::empty(1);
        let block = TransformBlock::new("boom", vec![], ["out"], |_| anyhow::bail!("bad input"));
        let err = frame.apply(&block, "g").unwrap_err();
        assert!(matches!(err, NodeError::Transform(ref e) if e.message == "bad input"));
    }

    #[test]
    fn test_constant_batch_len() {
        let a = Arg::values([1, 2, 3]);
        let b = Arg::value(9);
        let c = Arg::values(["x", "y", "z"]);
        assert_eq!(constant_batch_len("g", [("a", &a), ("b", &b), ("c", &c)]).unwrap(), 3);
        assert_eq!(constant_batch_len("g", [("b", &b)]).unwrap(), 1);

        let d = Arg::values([1, 2]);
        let err = constant_batch_len("g", [("a", &a), ("d", &d)]).unwrap_err();
        assert_eq!(err.node, "d");
    }

    #[test]
    fn test_signature_is_stable() {
        assert_eq!(doubler().signature(), "double(query.x) -> (y)");
    }
}
