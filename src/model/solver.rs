//! ODE solver settings carried through to the generated unit.
//!
//! The compiler does not integrate anything itself; solver choice and
//! tolerances are validated here and passed through as a flat configuration
//! list the host reads back from the module.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Error-weighting mode for the DVERK controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrType {
    Absolute,
    Relative,
    Combined,
}

impl ErrType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrType::Absolute => "absolute",
            ErrType::Relative => "relative",
            ErrType::Combined => "combined",
        }
    }
}

/// A value in the flat configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Float(f64),
    Int(u64),
    Str(String),
}

/// Solver selection plus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "solver", rename_all = "lowercase")]
pub enum OdeSolver {
    Dverk {
        tol: f64,
        err_type: ErrType,
        floor: f64,
        max_fun_calls: u64,
    },
    Lsoda {
        rel_tol: f64,
        abs_tol: f64,
        max_steps: u64,
    },
}

impl Default for OdeSolver {
    fn default() -> Self {
        OdeSolver::Dverk {
            tol: 1e-6,
            err_type: ErrType::Combined,
            floor: 1e-5,
            max_fun_calls: 100_000,
        }
    }
}

fn check_tol(name: &str, v: f64) -> Result<(), ModelError> {
    if !(1e-12..=1e-2).contains(&v) || !v.is_finite() {
        return Err(ModelError::invalid_setting(format!(
            "{} must be within [1e-12, 1e-2], got {}",
            name, v
        )));
    }
    Ok(())
}

impl OdeSolver {
    /// Verner 5(6) Runge-Kutta with the classic DVERK error controller.
    pub fn dverk(
        tol: f64,
        err_type: ErrType,
        floor: f64,
        max_fun_calls: u64,
    ) -> Result<Self, ModelError> {
        check_tol("tol", tol)?;
        check_tol("floor", floor)?;
        if max_fun_calls > 1_000_000 {
            return Err(ModelError::invalid_setting(format!(
                "max_fun_calls must be at most 1000000, got {}",
                max_fun_calls
            )));
        }
        Ok(OdeSolver::Dverk {
            tol,
            err_type,
            floor,
            max_fun_calls,
        })
    }

    /// LSODA with automatic stiff/non-stiff switching.
    pub fn lsoda(rel_tol: f64, abs_tol: f64, max_steps: u64) -> Result<Self, ModelError> {
        check_tol("rel_tol", rel_tol)?;
        check_tol("abs_tol", abs_tol)?;
        if max_steps == 0 || max_steps > 10_000 {
            return Err(ModelError::invalid_setting(format!(
                "max_steps must be within [1, 10000], got {}",
                max_steps
            )));
        }
        Ok(OdeSolver::Lsoda {
            rel_tol,
            abs_tol,
            max_steps,
        })
    }

    /// LSODA with its library defaults.
    pub fn lsoda_default() -> Self {
        OdeSolver::Lsoda {
            rel_tol: 1e-6,
            abs_tol: 1e-10,
            max_steps: 500,
        }
    }

    /// Flat key/value pass-through consumed by the host.
    pub fn as_configuration(&self) -> Vec<(String, ConfigValue)> {
        match self {
            OdeSolver::Dverk {
                tol,
                err_type,
                floor,
                max_fun_calls,
            } => vec![
                (
                    "odeint.solver".to_string(),
                    ConfigValue::Str("dverk".to_string()),
                ),
                ("odeint.dverk.tol".to_string(), ConfigValue::Float(*tol)),
                (
                    "odeint.dverk.err_typ".to_string(),
                    ConfigValue::Str(err_type.as_str().to_string()),
                ),
                ("odeint.dverk.floor".to_string(), ConfigValue::Float(*floor)),
                (
                    "odeint.dverk.max_fun_calls".to_string(),
                    ConfigValue::Int(*max_fun_calls),
                ),
            ],
            OdeSolver::Lsoda {
                rel_tol,
                abs_tol,
                max_steps,
            } => vec![
                (
                    "odeint.solver".to_string(),
                    ConfigValue::Str("lsoda".to_string()),
                ),
                (
                    "odeint.lsoda.rel_tol".to_string(),
                    ConfigValue::Float(*rel_tol),
                ),
                (
                    "odeint.lsoda.abs_tol".to_string(),
                    ConfigValue::Float(*abs_tol),
                ),
                (
                    "odeint.lsoda.max_steps".to_string(),
                    ConfigValue::Int(*max_steps),
                ),
            ],
        }
    }
}
