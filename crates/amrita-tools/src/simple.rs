// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Convenience registration for plain-function tools.
//!
//! Derives a [`FunctionDefinitionSchema`] from declared parameter names and
//! types plus a docstring whose `Args:` section supplies the per-parameter
//! descriptions — equivalent to writing the schema by hand.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::schema::{FunctionDefinitionSchema, ParamType, ParametersSchema, PropertySchema};
use crate::tool::{Tool, ToolReturn};

/// Declared parameter types for simple tools.
///
/// The mapping to schema types is deliberately coarse: integers become
/// `number`, booleans stay `boolean`, everything else is a `string`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleType {
    Integer,
    Boolean,
    Text,
}

impl SimpleType {
    fn to_param_type(self) -> ParamType {
        match self {
            Self::Integer => ParamType::Number,
            Self::Boolean => ParamType::Boolean,
            Self::Text => ParamType::String,
        }
    }
}

/// One declared parameter of a simple tool.
#[derive(Debug, Clone)]
pub struct SimpleParam {
    pub name: String,
    pub ty: SimpleType,
    pub required: bool,
}

impl SimpleParam {
    pub fn required(name: impl Into<String>, ty: SimpleType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, ty: SimpleType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
        }
    }
}

type SimpleFn = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync,
>;

struct SimpleTool {
    schema: FunctionDefinitionSchema,
    invoke: SimpleFn,
}

#[async_trait]
impl Tool for SimpleTool {
    fn schema(&self) -> FunctionDefinitionSchema {
        self.schema.clone()
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReturn> {
        Ok(ToolReturn::Text((self.invoke)(args).await?))
    }
}

/// Build a tool from a function, deriving the schema from `params` and the
/// docstring.
///
/// The docstring's text before an `Args:` line becomes the tool description;
/// lines under `Args:` of the form `name: description` become per-parameter
/// descriptions.
pub fn simple_tool<F, Fut>(
    name: impl Into<String>,
    docstring: &str,
    params: Vec<SimpleParam>,
    f: F,
) -> Arc<dyn Tool>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    let (description, arg_docs) = parse_docstring(docstring);
    let mut parameters = ParametersSchema::default();
    for p in params {
        let doc = arg_docs
            .iter()
            .find(|(n, _)| *n == p.name)
            .map(|(_, d)| d.clone())
            .unwrap_or_default();
        parameters = parameters.with_property(
            &p.name,
            PropertySchema::new(p.ty.to_param_type(), doc),
            p.required,
        );
    }
    let schema = FunctionDefinitionSchema::new(name, description).with_parameters(parameters);
    Arc::new(SimpleTool {
        schema,
        invoke: Arc::new(move |args| Box::pin(f(args))),
    })
}

/// Split a docstring into `(description, [(arg, doc)])` at its `Args:`
/// section.
fn parse_docstring(docstring: &str) -> (String, Vec<(String, String)>) {
    let mut description_lines = Vec::new();
    let mut arg_docs = Vec::new();
    let mut in_args = false;
    for line in docstring.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("args:") {
            in_args = true;
            continue;
        }
        if !in_args {
            description_lines.push(trimmed);
            continue;
        }
        if let Some((name, doc)) = trimmed.split_once(':') {
            if !name.trim().is_empty() {
                arg_docs.push((name.trim().to_string(), doc.trim().to_string()));
            }
        }
    }
    let description = description_lines.join(" ").trim().to_string();
    (description, arg_docs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
