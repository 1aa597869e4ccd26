//! Policy transpiler.
//!
//! Turns a raw policy document into a generic, order-preserving configuration
//! tree ([`Ast`]), rewrites it with declarative [`rules`], substitutes
//! `${...}` variables from one or more [`Vars`] contexts and fans templated
//! inputs out into concrete ones ([`render_inputs`]).

pub mod ast;
pub mod render;
pub mod rules;
pub mod vars;

pub use ast::{Ast, Dict, Node, Processors};
pub use render::render_inputs;
pub use rules::{AgentIdentity, OnConflict, Rule, RuleList};
pub use vars::Vars;

use thiserror::Error;

/// Errors raised while building, transforming or rendering a configuration tree.
#[derive(Debug, Error)]
pub enum TranspilerError {
    /// The document root is not a mapping.
    #[error("configuration root must be a mapping, found {found}")]
    InvalidRoot { found: &'static str },

    /// A value on `path` has an unexpected type.
    #[error("'{path}' must be a {expected}, found {found}")]
    InvalidType {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    /// An insert hit a non-container value on an intermediate segment.
    #[error("cannot insert into '{path}': '{segment}' is a {found}, not a dict")]
    NotAContainer {
        path: String,
        segment: String,
        found: &'static str,
    },

    /// An empty or malformed dotted path.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// A `${...}` expression could not be parsed.
    #[error("invalid variable expression '{expr}': {reason}")]
    InvalidVariable { expr: String, reason: String },

    /// No alternative of a `${...}` reference resolved.
    #[error("no value resolved for '{0}'")]
    Unresolved(String),

    /// An input `condition` could not be evaluated.
    #[error("invalid condition '{0}'")]
    InvalidCondition(String),

    /// A rule failed to apply.
    #[error("rule '{rule}' failed: {reason}")]
    Rule { rule: &'static str, reason: String },

    /// A regular expression in a rule failed to compile.
    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    /// Converting to or from YAML failed.
    #[error("yaml conversion failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Convenience alias for transpiler results.
pub type TranspilerResult<T> = Result<T, TranspilerError>;
