//! Workspace staging and external tool execution for Terraplane.
//!
//! This crate implements the execution layer: the template materializer that
//! stages an immutable template plus a rendered backend block into a workspace
//! root, variable file rendering, the `ToolExecutor` that runs the IaC binary
//! as a bounded, cancellable subprocess, and parsers for the tool's
//! machine-readable plan and output streams.

pub mod executor;
pub mod materialize;
pub mod parse;

pub use executor::{CancelToken, RunStatus, TimeoutTable, ToolExecutor, ToolRun, Verb};
pub use materialize::{
    materialize, render_backend_config, render_variables, resolve_template, write_variables,
    BACKEND_FILE, PLAN_FILE, VARIABLES_FILE,
};
pub use parse::{parse_outputs, parse_plan_summary, ToolOutputs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("materialization failed: {0}")]
    Materialize(String),
    #[error("invalid variable name: '{0}'")]
    InvalidVariable(String),
    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("unparseable tool output: {0}")]
    OutputParse(String),
}
