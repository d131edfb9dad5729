//! Building and loading generated units as dynamic libraries.
//!
//! Split in three: [`template`] scaffolds the cdylib package, [`build`]
//! runs cargo over it and collects the artifact, [`load`] opens the
//! artifact and reconstitutes the module behind its C factory.

pub mod build;
pub mod load;
pub mod template;

pub use build::{compile, BuildOptions, EventCallback};
pub use load::{load, LoadedModule};
