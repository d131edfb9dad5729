//! Error types for every stage of the translation pipeline.
//!
//! Each stage has its own error enum; [`TranError`] wraps them for callers
//! that drive the whole pipeline. Errors that point at model source carry a
//! [`Span`] and render a caret excerpt through [`TranError::render`].
//! The pipeline is fail-fast: the first error aborts the translation.

use thiserror::Error;

use crate::syntax::span::Span;

// ───────────────────────────── Parsing Errors ─────────────────────────────

/// Error raised while parsing model source text.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        ParseError {
            message: message.into(),
            span,
        }
    }

    pub fn unexpected(found: impl Into<String>, expected: &[&str], span: Span) -> Self {
        let found = found.into();
        let message = if expected.is_empty() {
            format!("Unexpected {}", found)
        } else {
            format!("Unexpected {}; expected {}", found, expected.join(" or "))
        };
        ParseError { message, span }
    }
}

// ───────────────────────────── Inlining Errors ─────────────────────────────

/// Error raised while flattening helper-function calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InlineError {
    #[error("Function '{name}' is not defined")]
    Undefined { name: String, span: Span },

    #[error("Function '{name}' missing required argument '{param}'")]
    MissingArgument {
        name: String,
        param: String,
        span: Span,
    },

    #[error("Function '{name}' got an unexpected keyword argument '{keyword}'")]
    UnexpectedKeyword {
        name: String,
        keyword: String,
        span: Span,
    },

    #[error("Function '{name}' takes {expected} arguments but {given} were given")]
    TooManyArguments {
        name: String,
        expected: usize,
        given: usize,
        span: Span,
    },

    #[error("Function '{name}' got multiple values for argument '{param}'")]
    DuplicateArgument {
        name: String,
        param: String,
        span: Span,
    },

    #[error("Only a single trailing return is supported in '{name}'")]
    MidBodyReturn { name: String, span: Span },

    #[error("Function '{name}' is used as a value but never returns one")]
    MissingReturn { name: String, span: Span },

    #[error("Function '{name}' expands recursively")]
    Recursion { name: String, span: Span },
}

impl InlineError {
    pub fn undefined(name: impl Into<String>, span: Span) -> Self {
        InlineError::Undefined {
            name: name.into(),
            span,
        }
    }

    pub fn missing_argument(
        name: impl Into<String>,
        param: impl Into<String>,
        span: Span,
    ) -> Self {
        InlineError::MissingArgument {
            name: name.into(),
            param: param.into(),
            span,
        }
    }

    pub fn unexpected_keyword(
        name: impl Into<String>,
        keyword: impl Into<String>,
        span: Span,
    ) -> Self {
        InlineError::UnexpectedKeyword {
            name: name.into(),
            keyword: keyword.into(),
            span,
        }
    }

    pub fn duplicate_argument(
        name: impl Into<String>,
        param: impl Into<String>,
        span: Span,
    ) -> Self {
        InlineError::DuplicateArgument {
            name: name.into(),
            param: param.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            InlineError::Undefined { span, .. }
            | InlineError::MissingArgument { span, .. }
            | InlineError::UnexpectedKeyword { span, .. }
            | InlineError::TooManyArguments { span, .. }
            | InlineError::DuplicateArgument { span, .. }
            | InlineError::MidBodyReturn { span, .. }
            | InlineError::MissingReturn { span, .. }
            | InlineError::Recursion { span, .. } => *span,
        }
    }
}

// ─────────────────────────── Sensitivity Errors ───────────────────────────

/// Error raised by the sensitivity (derivative) pass.
///
/// Statement-shape problems (chained assignments, bare `return`, misuse of
/// `solve`) are rejected by the parser; the pass itself only fails on scope
/// violations, on calls that survived inlining, and on blocks that already
/// carry derivative targets.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiffError {
    #[error("Invalid assignment target")]
    InvalidAssignTarget { span: Span },

    #[error("Variable '{name}' is used before definition")]
    UseBeforeDefinition { name: String, span: Span },

    #[error("Function '{name}' is not defined")]
    UndefinedFunction { name: String, span: Span },
}

impl DiffError {
    pub fn use_before_definition(name: impl Into<String>, span: Span) -> Self {
        DiffError::UseBeforeDefinition {
            name: name.into(),
            span,
        }
    }

    pub fn undefined_function(name: impl Into<String>, span: Span) -> Self {
        DiffError::UndefinedFunction {
            name: name.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            DiffError::InvalidAssignTarget { span }
            | DiffError::UseBeforeDefinition { span, .. }
            | DiffError::UndefinedFunction { span, .. } => *span,
        }
    }
}

// ──────────────────────────── Codegen Errors ────────────────────────────

/// Error raised while type-checking or emitting the native unit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodegenError {
    #[error("{message}")]
    Type { message: String, span: Span },

    #[error("Unsupported assignment target: {target}")]
    UnsupportedTarget { target: String, span: Span },

    #[error("Module kind does not support {what}")]
    KindMismatch { what: String, span: Span },
}

impl CodegenError {
    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        CodegenError::Type {
            message: message.into(),
            span,
        }
    }

    pub fn type_conflict(
        name: impl Into<String>,
        declared: impl Into<String>,
        assigned: impl Into<String>,
        span: Span,
    ) -> Self {
        CodegenError::Type {
            message: format!(
                "Variable '{}' has type {} and cannot be assigned {}",
                name.into(),
                declared.into(),
                assigned.into()
            ),
            span,
        }
    }

    pub fn unsupported_target(target: impl Into<String>, span: Span) -> Self {
        CodegenError::UnsupportedTarget {
            target: target.into(),
            span,
        }
    }

    pub fn kind_mismatch(what: impl Into<String>, span: Span) -> Self {
        CodegenError::KindMismatch {
            what: what.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            CodegenError::Type { span, .. }
            | CodegenError::UnsupportedTarget { span, .. }
            | CodegenError::KindMismatch { span, .. } => *span,
        }
    }
}

// ───────────────────────────── Build Errors ─────────────────────────────

/// Error raised while compiling or loading a generated module.
///
/// Members of the `dylib` feature; the build driver wraps these in
/// `anyhow` context chains rather than routing them through [`TranError`],
/// since compilation happens outside the translation pipeline.
#[cfg(feature = "dylib")]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("Could not locate a `cargo` executable; set CARGO or install rustup")]
    CargoNotFound,

    #[error("cargo {command} exited with {status}")]
    CargoFailed { command: String, status: String },

    #[error("Build produced no {expected} artifact under {dir}")]
    MissingArtifact { expected: String, dir: String },

    #[error("Module ABI version {found} does not match host version {host}")]
    AbiMismatch { found: u32, host: u32 },
}

#[cfg(feature = "dylib")]
impl BuildError {
    pub fn cargo_failed(command: impl Into<String>, status: impl Into<String>) -> Self {
        BuildError::CargoFailed {
            command: command.into(),
            status: status.into(),
        }
    }

    pub fn missing_artifact(expected: impl Into<String>, dir: impl Into<String>) -> Self {
        BuildError::MissingArtifact {
            expected: expected.into(),
            dir: dir.into(),
        }
    }
}

// ───────────────────────── Model Definition Errors ─────────────────────────

/// Error raised while building or validating descriptors, variance matrices,
/// solution parameters, or solver settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Duplicate symbol name '{name}'")]
    DuplicateName { name: String },

    #[error("Unknown parameter '{param}' for closed-form solution {solution}")]
    UnknownSolutionParam { param: String, solution: String },

    #[error("Missing required parameter '{param}' for closed-form solution {solution}")]
    MissingSolutionParam { param: String, solution: String },

    #[error("Compartment index {index} is out of range (model has {n_cmt} compartments)")]
    UnknownCompartment { index: usize, n_cmt: usize },

    #[error("Invalid variance matrix: {message}")]
    InvalidMatrix { message: String },

    #[error("Invalid solver setting: {message}")]
    InvalidSetting { message: String },
}

impl ModelError {
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        ModelError::DuplicateName { name: name.into() }
    }

    pub fn unknown_solution_param(
        param: impl Into<String>,
        solution: impl Into<String>,
    ) -> Self {
        ModelError::UnknownSolutionParam {
            param: param.into(),
            solution: solution.into(),
        }
    }

    pub fn missing_solution_param(
        param: impl Into<String>,
        solution: impl Into<String>,
    ) -> Self {
        ModelError::MissingSolutionParam {
            param: param.into(),
            solution: solution.into(),
        }
    }

    pub fn invalid_matrix(message: impl Into<String>) -> Self {
        ModelError::InvalidMatrix {
            message: message.into(),
        }
    }

    pub fn invalid_setting(message: impl Into<String>) -> Self {
        ModelError::InvalidSetting {
            message: message.into(),
        }
    }
}

// ──────────────────────────── Top-level Error ────────────────────────────

/// Any error the translation pipeline can produce.
#[derive(Error, Debug)]
pub enum TranError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Inline(#[from] InlineError),

    #[error("{0}")]
    Diff(#[from] DiffError),

    #[error("{0}")]
    Codegen(#[from] CodegenError),

    #[error("{0}")]
    Model(#[from] ModelError),
}

impl TranError {
    /// The source span this error points at, when it has one.
    pub fn span(&self) -> Option<Span> {
        let span = match self {
            TranError::Parse(e) => e.span,
            TranError::Inline(e) => e.span(),
            TranError::Diff(e) => e.span(),
            TranError::Codegen(e) => e.span(),
            TranError::Model(_) => return None,
        };
        if span.is_synthetic() {
            None
        } else {
            Some(span)
        }
    }

    /// Render `error: {message}` plus a caret excerpt against the source.
    pub fn render(&self, source: &str) -> String {
        match self.span() {
            Some(span) => format!("error: {}\n{}", self, span.excerpt(source)),
            None => format!("error: {}", self),
        }
    }
}
