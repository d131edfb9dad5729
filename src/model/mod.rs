//! Model definition: descriptors, variance structures, closed-form solution
//! registry and ODE solver settings.

pub mod descriptor;
pub mod matrix;
pub mod solution;
pub mod solver;

pub use descriptor::{
    Compartment, CovKind, Covariate, Eps, Eta, ModuleBuilder, ModuleDescriptor, ModuleKind,
    SharedVar, Theta,
};
pub use matrix::{Omega, Sigma, VarianceBlock, VarianceMatrix};
pub use solution::{solve_args, ParamSpec, SolutionKind, SolutionMeta};
pub use solver::{ConfigValue, ErrType, OdeSolver};
