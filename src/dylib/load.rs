//! Load a compiled unit and reconstitute its module.

use std::ffi::c_void;
use std::path::Path;

use anyhow::{Context, Result};
use libloading::{Library, Symbol};

use crate::error::BuildError;
use crate::runtime::{PredModule, MODULE_ABI_VERSION};

/// A module resolved from a compiled artifact.
///
/// The library handle lives alongside the module. Dropping the library
/// while the module is still reachable would unmap its code, so both
/// travel together and drop together, module first.
pub struct LoadedModule {
    module: Box<dyn PredModule>,
    _lib: Library,
}

impl LoadedModule {
    pub fn module(&self) -> &dyn PredModule {
        self.module.as_ref()
    }

    pub fn module_mut(&mut self) -> &mut dyn PredModule {
        self.module.as_mut()
    }
}

/// Opens `path` and reconstitutes the module behind its factory.
///
/// The artifact's ABI version is checked before the factory runs; a
/// mismatch is reported as [`BuildError::AbiMismatch`].
///
/// # Safety
///
/// `path` must be an artifact produced by
/// [`compile`](crate::dylib::compile) against this crate version. The
/// factory contract (version gate plus a double-boxed trait object behind
/// the raw pointer) is what makes the cast back to `Box<dyn PredModule>`
/// sound; loading an arbitrary library violates it.
pub unsafe fn load(path: &Path) -> Result<LoadedModule> {
    let lib = unsafe { Library::new(path) }
        .with_context(|| format!("Could not open {}", path.display()))?;

    let abi: Symbol<unsafe extern "C" fn() -> u32> = unsafe { lib.get(b"__module_abi_version") }
        .context("Artifact exports no __module_abi_version")?;
    let found = unsafe { abi() };
    if found != MODULE_ABI_VERSION {
        return Err(BuildError::AbiMismatch {
            found,
            host: MODULE_ABI_VERSION,
        }
        .into());
    }

    let factory: Symbol<unsafe extern "C" fn() -> *mut c_void> =
        unsafe { lib.get(b"__module_factory") }.context("Artifact exports no __module_factory")?;
    let raw = unsafe { factory() };
    let module = *unsafe { Box::from_raw(raw as *mut Box<dyn PredModule>) };

    Ok(LoadedModule { module, _lib: lib })
}
