//! Translate pharmacometric model code into native prediction modules.
//!
//! The pipeline has three stages. Helper functions in the model text are
//! inlined away, the flattened statements are expanded with exact first-
//! and second-order sensitivity assignments, and the result is emitted as
//! a self-contained Rust translation unit: a symbol table with by-index
//! and by-name setters, a [`runtime::PredModule`] implementation, and the
//! C factory pair a host resolves after loading the compiled unit.
//!
//! [`translate::Translator`] drives the stages end to end; each stage
//! module is usable on its own. The `dylib` feature adds compiling units
//! to dynamic libraries and loading them back.

pub mod codegen;
pub mod diff;
#[cfg(feature = "dylib")]
pub mod dylib;
pub mod error;
pub mod inline;
pub mod model;
pub mod runtime;
pub mod syntax;
pub mod translate;

pub use crate::codegen::{GeneratedUnit, SymbolClass, SymbolEntry};
pub use crate::diff::SensitivityOrder;
#[cfg(feature = "dylib")]
pub use crate::dylib::{compile, load, BuildOptions, LoadedModule};
pub use crate::error::TranError;
pub use crate::inline::{FunctionDef, FunctionEnv, InlineStage, Param};
pub use crate::model::{
    ModuleBuilder, ModuleDescriptor, ModuleKind, OdeSolver, Omega, Sigma, SolutionKind,
};
pub use crate::runtime::{PredContext, PredModule};
pub use crate::syntax::parse_model;
pub use crate::translate::{Translation, Translator};
