//! Analysis function trait, source reader trait, and the registration table.
//!
//! The registry is built once at process start and passed by reference into
//! the compiler and the runner; there is no global registry.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use cairn_types::{CairnError, Result};

use crate::graph::SourceFormat;

// ---------------------------------------------------------------------------
// Function inputs
// ---------------------------------------------------------------------------

/// A declared argument of an analysis function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: String,
    pub optional: bool,
}

impl ArgSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

/// An argument value, or an explicit marker that no upstream provided it.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Present(Value),
    Absent,
}

/// Merged, renamed upstream values keyed by argument name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionInputs {
    args: BTreeMap<String, Input>,
}

impl FunctionInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, input: Input) {
        self.args.insert(name.into(), input);
    }

    pub fn input(&self, name: &str) -> &Input {
        self.args.get(name).unwrap_or(&Input::Absent)
    }

    /// The value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.args.get(name) {
            Some(Input::Present(v)) => Some(v),
            _ => None,
        }
    }

    pub fn is_present(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.args.keys().map(String::as_str)
    }
}

/// Everything an analysis function receives for one invocation.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub node_id: String,
    pub inputs: FunctionInputs,
    pub params: Value,
    /// Dedicated directory for any side files the function writes.
    pub output_dir: PathBuf,
}

/// What an analysis function returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionOutput {
    pub values: BTreeMap<String, Value>,
    /// The function's private metadata fragment.
    pub metadata: Option<Value>,
}

impl FunctionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An opaque analysis step bound to a transform node.
#[async_trait]
pub trait AnalysisFunction: Send + Sync {
    /// Registered name, e.g. `"basic/sum"`.
    fn name(&self) -> &str;

    /// Arguments the function expects, in order.
    fn args(&self) -> Vec<ArgSpec>;

    async fn invoke(&self, call: FunctionCall) -> Result<FunctionOutput>;
}

/// Loads a source node's raw input into an artifact value.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(
        &self,
        format: SourceFormat,
        paths: &[PathBuf],
        hints: &BTreeMap<String, String>,
        params: &Value,
    ) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// FunctionRegistry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<dyn AnalysisFunction>>,
    readers: HashMap<SourceFormat, Arc<dyn SourceReader>>,
    fallback_reader: Arc<dyn SourceReader>,
}

impl FunctionRegistry {
    /// Empty table; sources without a dedicated reader yield path references.
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
            readers: HashMap::new(),
            fallback_reader: Arc::new(crate::sources::PathReferenceReader),
        }
    }

    pub fn register(&mut self, function: impl AnalysisFunction + 'static) {
        self.register_arc(Arc::new(function));
    }

    pub fn register_arc(&mut self, function: Arc<dyn AnalysisFunction>) {
        let name = function.name().to_string();
        if self.functions.insert(name.clone(), function).is_some() {
            tracing::warn!(function = %name, "Analysis function re-registered");
        }
    }

    pub fn register_reader(&mut self, format: SourceFormat, reader: impl SourceReader + 'static) {
        self.readers.insert(format, Arc::new(reader));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn AnalysisFunction>> {
        self.functions.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function(&self, name: &str) -> Result<&Arc<dyn AnalysisFunction>> {
        self.get(name)
            .ok_or_else(|| CairnError::Graph(format!("no analysis function registered as '{name}'")))
    }

    pub fn reader(&self, format: SourceFormat) -> &Arc<dyn SourceReader> {
        self.readers.get(&format).unwrap_or(&self.fallback_reader)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

/// Registry with the built-in CSV reader and basic functions.
pub fn default_registry() -> FunctionRegistry {
    let mut reg = FunctionRegistry::new();
    reg.register_reader(SourceFormat::Csv, crate::sources::CsvReader);
    reg.register(crate::functions::SumFunction);
    reg.register(crate::functions::ScaleFunction);
    reg
}
