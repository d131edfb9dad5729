//! Host-side support for generated prediction modules.
//!
//! A generated unit defines a `__Module` type implementing [`PredModule`]
//! and an `extern "C"` factory that returns it double-boxed. The host
//! drives the module through a [`PredContext`]: it fills the state vector
//! and the symbol table, calls `__pred`, and reads back the right-hand
//! sides, dosing parameters and the result vector.
//!
//! All sensitivity storage is flat. The layout functions in this module are
//! the single source of truth for that indexing; the emitter computes the
//! same slots at generation time, so a unit and a host built against the
//! same crate version always agree.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::model::{ConfigValue, ModuleKind};

/// Bumped whenever [`PredContext`], [`PredModule`] or the factory contract
/// changes shape; loaded units must match exactly.
pub const MODULE_ABI_VERSION: u32 = 1;

/// Protected logarithm used by generated units: `ln(v)` for positive `v`,
/// `0.0` otherwise.
pub fn plog(v: f64) -> f64 {
    if v <= 0.0 {
        0.0
    } else {
        v.ln()
    }
}

// ───────────────────────────── Flat layouts ─────────────────────────────

/// Row of the unordered pair `(u, v)`, `u >= v`, in a lower-triangle
/// enumeration: `u(u+1)/2 + v`.
pub fn pair_index(u: usize, v: usize) -> usize {
    debug_assert!(u >= v);
    u * (u + 1) / 2 + v
}

/// Number of lower-triangle pairs over `n` effects.
pub fn n_pairs(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Length of the state vector: amounts, then the first-order rows, then
/// the second-order rows.
pub fn state_len(n_cmt: usize, n_eta: usize) -> usize {
    n_cmt * (1 + n_eta + n_pairs(n_eta))
}

/// Flat slot of `∂A_i/∂η_k`.
pub fn state_first(n_cmt: usize, cmt: usize, eta: usize) -> usize {
    n_cmt + eta * n_cmt + cmt
}

/// Flat slot of `∂²A_i/∂η_u∂η_v`, `u >= v`.
pub fn state_second(n_cmt: usize, n_eta: usize, cmt: usize, u: usize, v: usize) -> usize {
    n_cmt + n_cmt * n_eta + pair_index(u, v) * n_cmt + cmt
}

/// Length of the result vector: value, η block, ε block, mixed block,
/// η-pair block.
pub fn y_len(n_eta: usize, n_eps: usize) -> usize {
    1 + n_eta + n_eps + n_eta * n_eps + n_pairs(n_eta)
}

/// Result slot of `∂y/∂η_k`.
pub fn y_eta(eta: usize) -> usize {
    1 + eta
}

/// Result slot of `∂y/∂ε_e`.
pub fn y_eps(n_eta: usize, eps: usize) -> usize {
    1 + n_eta + eps
}

/// Result slot of `∂²y/∂η_k∂ε_e`.
pub fn y_mixed(n_eta: usize, n_eps: usize, eta: usize, eps: usize) -> usize {
    1 + n_eta + n_eps + eta * n_eps + eps
}

/// Result slot of `∂²y/∂η_u∂η_v`, `u >= v`.
pub fn y_second(n_eta: usize, n_eps: usize, u: usize, v: usize) -> usize {
    1 + n_eta + n_eps + n_eta * n_eps + pair_index(u, v)
}

// ──────────────────────────── Evaluation errors ────────────────────────────

/// Error raised while a generated module evaluates.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredError {
    #[error("Model calls solve() but no solution hook is installed")]
    MissingSolver,

    #[error("Solution hook failed: {message}")]
    Solver { message: String },
}

impl PredError {
    pub fn solver(message: impl Into<String>) -> Self {
        PredError::Solver {
            message: message.into(),
        }
    }
}

// ─────────────────────────── Parameter slots ───────────────────────────

/// A dosing parameter or solve argument together with its sensitivity rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSlot {
    pub value: f64,
    wrt: Vec<f64>,
    wrt2: Vec<f64>,
}

impl ParamSlot {
    fn zeroed(n_eta: usize) -> Self {
        ParamSlot {
            value: 0.0,
            wrt: vec![0.0; n_eta],
            wrt2: vec![0.0; n_pairs(n_eta)],
        }
    }

    /// `∂value/∂η_k`.
    pub fn wrt(&self, eta: usize) -> f64 {
        self.wrt[eta]
    }

    /// `∂²value/∂η_u∂η_v`, `u >= v`.
    pub fn wrt2(&self, u: usize, v: usize) -> f64 {
        self.wrt2[pair_index(u, v)]
    }
}

/// Closed-form results filled in by the solution hook.
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionValues {
    /// Predicted concentration `F`.
    pub f: f64,
    /// Per-compartment amounts.
    pub a: Vec<f64>,
    f_wrt: Vec<f64>,
    f_wrt2: Vec<f64>,
}

impl SolutionValues {
    fn zeroed(n_cmt: usize, n_eta: usize) -> Self {
        SolutionValues {
            f: 0.0,
            a: vec![0.0; n_cmt],
            f_wrt: vec![0.0; n_eta],
            f_wrt2: vec![0.0; n_pairs(n_eta)],
        }
    }

    /// `∂F/∂η_k`.
    pub fn f_wrt(&self, eta: usize) -> f64 {
        self.f_wrt[eta]
    }

    pub fn set_f_wrt(&mut self, eta: usize, value: f64) {
        self.f_wrt[eta] = value;
    }

    /// `∂²F/∂η_u∂η_v`, `u >= v`.
    pub fn f_wrt2(&self, u: usize, v: usize) -> f64 {
        self.f_wrt2[pair_index(u, v)]
    }

    pub fn set_f_wrt2(&mut self, u: usize, v: usize, value: f64) {
        self.f_wrt2[pair_index(u, v)] = value;
    }
}

// ──────────────────────────── Evaluation context ────────────────────────────

/// Hook evaluating the closed-form solution against the staged solve
/// arguments. It fills [`PredContext::solution`] and the state vector
/// (amounts plus their sensitivities, state layout).
pub type SolverHook = Box<dyn FnMut(&mut PredContext) -> Result<(), PredError> + Send>;

/// Everything a generated `__pred` reads and writes during one evaluation.
///
/// Vectors are sized for second order regardless of what the unit was
/// generated with; rows the unit never writes stay zero.
pub struct PredContext {
    n_cmt: usize,
    n_eta: usize,
    n_eps: usize,
    /// Integration time.
    pub t: f64,
    /// Amounts and integrated sensitivities (state layout).
    pub a: Vec<f64>,
    /// Right-hand sides and their sensitivity rows (state layout).
    pub dadt: Vec<f64>,
    /// `∂(dA_i/dt)/∂A_j`, row-major `i·n_cmt + j`.
    pub dadt_jac: Vec<f64>,
    /// Result vector (result layout).
    pub y: Vec<f64>,
    /// Result-kind flag stored next to `y`.
    pub y_kind: u8,
    /// First-order guard flag read by the generated unit.
    pub first_order: bool,
    /// Second-order guard flag read by the generated unit.
    pub second_order: bool,
    /// Named locals exported after evaluation.
    pub locals: HashMap<String, f64>,
    /// Closed-form results, filled by [`PredContext::solve`].
    pub solution: SolutionValues,
    dose_params: BTreeMap<(usize, String), ParamSlot>,
    solve_args: BTreeMap<String, ParamSlot>,
    solver: Option<SolverHook>,
}

impl PredContext {
    pub fn new(n_cmt: usize, n_eta: usize, n_eps: usize) -> Self {
        PredContext {
            n_cmt,
            n_eta,
            n_eps,
            t: 0.0,
            a: vec![0.0; state_len(n_cmt, n_eta)],
            dadt: vec![0.0; state_len(n_cmt, n_eta)],
            dadt_jac: vec![0.0; n_cmt * n_cmt],
            y: vec![0.0; y_len(n_eta, n_eps)],
            y_kind: 0,
            first_order: true,
            second_order: true,
            locals: HashMap::new(),
            solution: SolutionValues::zeroed(n_cmt, n_eta),
            dose_params: BTreeMap::new(),
            solve_args: BTreeMap::new(),
            solver: None,
        }
    }

    pub fn n_cmt(&self) -> usize {
        self.n_cmt
    }

    pub fn n_eta(&self) -> usize {
        self.n_eta
    }

    pub fn n_eps(&self) -> usize {
        self.n_eps
    }

    /// `∂A_i/∂η_k` out of the state vector.
    pub fn a_wrt(&self, cmt: usize, eta: usize) -> f64 {
        self.a[state_first(self.n_cmt, cmt, eta)]
    }

    /// `∂²A_i/∂η_u∂η_v` out of the state vector, `u >= v`.
    pub fn a_wrt2(&self, cmt: usize, u: usize, v: usize) -> f64 {
        self.a[state_second(self.n_cmt, self.n_eta, cmt, u, v)]
    }

    fn dose_slot(&mut self, cmt: usize, param: &str) -> &mut ParamSlot {
        let n_eta = self.n_eta;
        self.dose_params
            .entry((cmt, param.to_string()))
            .or_insert_with(|| ParamSlot::zeroed(n_eta))
    }

    pub fn set_dose_param(&mut self, cmt: usize, param: &str, value: f64) {
        self.dose_slot(cmt, param).value = value;
    }

    pub fn set_dose_param_wrt(&mut self, cmt: usize, param: &str, eta: usize, value: f64) {
        self.dose_slot(cmt, param).wrt[eta] = value;
    }

    pub fn set_dose_param_wrt2(
        &mut self,
        cmt: usize,
        param: &str,
        u: usize,
        v: usize,
        value: f64,
    ) {
        let idx = pair_index(u, v);
        self.dose_slot(cmt, param).wrt2[idx] = value;
    }

    /// The staged dosing parameter for a compartment, if the unit set one.
    pub fn dose_param(&self, cmt: usize, param: &str) -> Option<&ParamSlot> {
        self.dose_params.get(&(cmt, param.to_string()))
    }

    /// Every staged dosing parameter, ordered by compartment then name.
    pub fn dose_params(&self) -> impl Iterator<Item = (usize, &str, &ParamSlot)> + '_ {
        self.dose_params
            .iter()
            .map(|((cmt, param), slot)| (*cmt, param.as_str(), slot))
    }

    fn solve_slot(&mut self, key: &str) -> &mut ParamSlot {
        let n_eta = self.n_eta;
        self.solve_args
            .entry(key.to_string())
            .or_insert_with(|| ParamSlot::zeroed(n_eta))
    }

    pub fn set_solve_arg(&mut self, key: &str, value: f64) {
        self.solve_slot(key).value = value;
    }

    pub fn set_solve_arg_wrt(&mut self, key: &str, eta: usize, value: f64) {
        self.solve_slot(key).wrt[eta] = value;
    }

    pub fn set_solve_arg_wrt2(&mut self, key: &str, u: usize, v: usize, value: f64) {
        let idx = pair_index(u, v);
        self.solve_slot(key).wrt2[idx] = value;
    }

    /// The staged solve argument under a canonical key, e.g. `"CL"`.
    pub fn solve_arg(&self, key: &str) -> Option<&ParamSlot> {
        self.solve_args.get(key)
    }

    /// Every staged solve argument, ordered by key.
    pub fn solve_args(&self) -> impl Iterator<Item = (&str, &ParamSlot)> + '_ {
        self.solve_args
            .iter()
            .map(|(key, slot)| (key.as_str(), slot))
    }

    /// Install the closed-form solution hook.
    pub fn install_solver(
        &mut self,
        hook: impl FnMut(&mut PredContext) -> Result<(), PredError> + Send + 'static,
    ) {
        self.solver = Some(Box::new(hook));
    }

    /// Evaluate the staged solve arguments through the installed hook.
    ///
    /// Units generated from closed-form models call this at their `solve()`
    /// statement; everything staged through the `set_solve_arg` family is
    /// visible to the hook, and [`PredContext::solution`] plus the state
    /// vector hold the results afterwards.
    pub fn solve(&mut self) -> Result<(), PredError> {
        let mut hook = self.solver.take().ok_or(PredError::MissingSolver)?;
        let result = hook(self);
        self.solver = Some(hook);
        result
    }
}

// ───────────────────────────── Module interface ─────────────────────────────

/// Access to a generated unit's symbol table.
///
/// Thetas, etas and epsilons are set by declaration index; covariates and
/// shared variables by name. Index setters ignore out-of-range indices;
/// name setters report whether the name was known.
pub trait SymbolTable {
    fn set_theta(&mut self, index: usize, value: f64);
    fn set_eta(&mut self, index: usize, value: f64);
    fn set_eps(&mut self, index: usize, value: f64);
    fn set_covariate(&mut self, name: &str, value: f64) -> bool;
    /// Text-typed covariate columns.
    fn set_covariate_text(&mut self, name: &str, value: &str) -> bool;
    fn set_shared(&mut self, name: &str, value: f64) -> bool;
    /// Declared symbol names, in declaration-class order.
    fn names(&self) -> &'static [&'static str];
}

/// The interface every generated prediction module exports.
pub trait PredModule: Send {
    fn kind(&self) -> ModuleKind;
    fn advan(&self) -> u8;
    fn trans(&self) -> u8;
    fn n_cmt(&self) -> usize;
    fn n_eta(&self) -> usize;
    fn n_eps(&self) -> usize;
    fn symbol_table(&self) -> &dyn SymbolTable;
    fn symbol_table_mut(&mut self) -> &mut dyn SymbolTable;
    /// The ODE solver settings the module was generated with, as flat
    /// configuration keys, passed through untouched.
    fn solver_configuration(&self) -> Vec<(String, ConfigValue)>;
    /// Shared variables the host harvests from the exported locals.
    fn shared_names(&self) -> Vec<String>;
    /// Evaluate the model statements against `ctx`.
    fn __pred(&self, ctx: &mut PredContext) -> Result<(), PredError>;
}
