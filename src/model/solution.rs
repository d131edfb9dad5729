//! Closed-form solution registry.
//!
//! Each solution kind carries its structural metadata (compartment count,
//! ADVAN/TRANS family, default dose/observation compartments) and its
//! parameter table. Surface keyword arguments (`cl`, `ka`, `alag1`, ...) map
//! onto canonical [`ParamKey`]s; required parameters are checked here, and
//! kind-specific pins and fallbacks (micro pins `V` to 1, physio defaults
//! `S2` to the volume expression) are applied before the solve-argument
//! assignments are emitted.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ModelError;
use crate::syntax::expr::Expr;
use crate::syntax::stmt::ParamKey;

/// Library closed-form solution families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionKind {
    /// Extravascular one-compartment, micro rate constants (`K`, `KA`).
    EvOneCmtMicro,
    /// Extravascular one-compartment, physiological parameters
    /// (`CL`, `V`, `KA`).
    EvOneCmtPhysio,
}

impl SolutionKind {
    pub fn name(&self) -> &'static str {
        match self {
            SolutionKind::EvOneCmtMicro => "ev_one_cmt_micro",
            SolutionKind::EvOneCmtPhysio => "ev_one_cmt_physio",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ev_one_cmt_micro" => SolutionKind::EvOneCmtMicro,
            "ev_one_cmt_physio" => SolutionKind::EvOneCmtPhysio,
            _ => return None,
        })
    }

    pub fn meta(&self) -> &'static SolutionMeta {
        &REGISTRY[self]
    }
}

/// Structural metadata of one closed-form solution.
#[derive(Debug, Clone)]
pub struct SolutionMeta {
    pub n_cmt: usize,
    pub advan: u8,
    pub trans: u8,
    /// 1-based.
    pub defdose_cmt: usize,
    /// 1-based.
    pub defobs_cmt: usize,
    /// Surface keyword, canonical key, required flag — in emission order.
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub keyword: &'static str,
    pub key: ParamKey,
    pub required: bool,
    /// Not accepted from the surface; filled by a kind-specific pin.
    pub hidden: bool,
}

impl ParamSpec {
    fn required(keyword: &'static str, key: ParamKey) -> Self {
        ParamSpec {
            keyword,
            key,
            required: true,
            hidden: false,
        }
    }

    fn optional(keyword: &'static str, key: ParamKey) -> Self {
        ParamSpec {
            keyword,
            key,
            required: false,
            hidden: false,
        }
    }

    fn pinned(keyword: &'static str, key: ParamKey) -> Self {
        ParamSpec {
            keyword,
            key,
            required: false,
            hidden: true,
        }
    }
}

fn dose_param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::optional("alag1", ParamKey::indexed("ALAG", 0)),
        ParamSpec::optional("alag2", ParamKey::indexed("ALAG", 1)),
        ParamSpec::optional("s1", ParamKey::indexed("S", 0)),
        ParamSpec::optional("s2", ParamKey::indexed("S", 1)),
        ParamSpec::optional("f1", ParamKey::indexed("F", 0)),
        ParamSpec::optional("f2", ParamKey::indexed("F", 1)),
        ParamSpec::optional("r1", ParamKey::indexed("R", 0)),
        ParamSpec::optional("r2", ParamKey::indexed("R", 1)),
        ParamSpec::optional("d1", ParamKey::indexed("D", 0)),
        ParamSpec::optional("d2", ParamKey::indexed("D", 1)),
    ]
}

lazy_static! {
    static ref REGISTRY: HashMap<SolutionKind, SolutionMeta> = {
        let mut m = HashMap::new();
        let mut micro = vec![
            ParamSpec::required("k", ParamKey::plain("K")),
            ParamSpec::pinned("v", ParamKey::plain("V")),
            ParamSpec::required("ka", ParamKey::plain("KA")),
        ];
        micro.extend(dose_param_specs());
        m.insert(
            SolutionKind::EvOneCmtMicro,
            SolutionMeta {
                n_cmt: 2,
                advan: 2,
                trans: 1,
                defdose_cmt: 1,
                defobs_cmt: 2,
                params: micro,
            },
        );
        let mut physio = vec![
            ParamSpec::required("cl", ParamKey::plain("CL")),
            ParamSpec::required("v", ParamKey::plain("V")),
            ParamSpec::required("ka", ParamKey::plain("KA")),
        ];
        physio.extend(dose_param_specs());
        m.insert(
            SolutionKind::EvOneCmtPhysio,
            SolutionMeta {
                n_cmt: 2,
                advan: 2,
                trans: 2,
                defdose_cmt: 1,
                defobs_cmt: 2,
                params: physio,
            },
        );
        m
    };
}

/// Map surface keyword arguments to ordered `(ParamKey, Expr)` pairs.
///
/// Required parameters must be present; unknown keywords are rejected.
/// Unset optionals are omitted, except for the kind pins: micro emits
/// `V = 1`, physio defaults `S2` to the volume expression.
pub fn solve_args(
    kind: SolutionKind,
    given: &[(String, Expr)],
) -> Result<Vec<(ParamKey, Expr)>, ModelError> {
    let meta = kind.meta();
    for (kw, _) in given {
        if !meta.params.iter().any(|p| p.keyword == kw && !p.hidden) {
            return Err(ModelError::unknown_solution_param(kw, kind.name()));
        }
    }
    let lookup = |kw: &str| -> Option<&Expr> {
        given.iter().find(|(k, _)| k == kw).map(|(_, e)| e)
    };
    let mut out = Vec::new();
    for spec in &meta.params {
        match lookup(spec.keyword) {
            Some(expr) => out.push((spec.key.clone(), expr.clone())),
            None if spec.required => {
                return Err(ModelError::missing_solution_param(
                    spec.keyword,
                    kind.name(),
                ));
            }
            None => match (kind, spec.keyword) {
                // Micro constants have no volume argument; the solution
                // expects V and gets the neutral value.
                (SolutionKind::EvOneCmtMicro, "v") => {
                    out.push((spec.key.clone(), Expr::num(1.0)));
                }
                // Physio scales the observation compartment by V unless
                // the model overrides it.
                (SolutionKind::EvOneCmtPhysio, "s2") => {
                    if let Some(v) = lookup("v") {
                        out.push((spec.key.clone(), v.clone()));
                    }
                }
                _ => {}
            },
        }
    }
    Ok(out)
}
