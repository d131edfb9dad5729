//! Model descriptors: the declared symbols a body is compiled against.
//!
//! A [`ModuleDescriptor`] lists the fixed effects (thetas), random effects
//! (etas, epsilons), data columns, shared variables and compartments of one
//! model, plus the structural metadata (kind, ADVAN/TRANS, default dose and
//! observation compartments). Descriptors are plain serializable data;
//! [`ModuleBuilder`] is the checked way to construct them.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::solution::SolutionKind;
use crate::syntax::expr::Leaf;

/// Fixed-effect parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theta {
    pub name: String,
    pub init: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
    #[serde(default)]
    pub fixed: bool,
}

/// Subject-level random effect; its variance lives in the Omega matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eta {
    pub name: String,
}

/// Observation-level random effect; its variance lives in the Sigma matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eps {
    pub name: String,
}

/// Value type of a data column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovKind {
    #[default]
    Numeric,
    Text,
}

/// Data column variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariate {
    pub name: String,
    #[serde(default)]
    pub kind: CovKind,
}

/// Shared (population-computed) variable, exported by name after prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedVar {
    pub name: String,
}

/// A model compartment. Present only for ODE models; closed-form models
/// carry their compartment count in the solution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compartment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Structural kind of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Compartment amounts integrated from `dadt` right-hand sides.
    Ode,
    /// Amounts and concentration from a library closed-form solution.
    ClosedForm,
    /// Direct prediction, no compartments.
    Pred,
}

/// Everything the pipeline needs to know about a model besides its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub kind: ModuleKind,
    pub thetas: Vec<Theta>,
    pub etas: Vec<Eta>,
    pub epsilons: Vec<Eps>,
    pub covariates: Vec<Covariate>,
    pub sharedvars: Vec<SharedVar>,
    pub cmts: Vec<Compartment>,
    pub n_cmt: usize,
    pub advan: u8,
    pub trans: u8,
    /// 1-based, 0 when unset.
    pub defdose_cmt: usize,
    /// 1-based, 0 when unset.
    pub defobs_cmt: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<SolutionKind>,
}

impl ModuleDescriptor {
    pub fn n_eta(&self) -> usize {
        self.etas.len()
    }

    pub fn n_eps(&self) -> usize {
        self.epsilons.len()
    }

    pub fn eta_index(&self, name: &str) -> Option<usize> {
        self.etas.iter().position(|e| e.name == name)
    }

    pub fn eps_index(&self, name: &str) -> Option<usize> {
        self.epsilons.iter().position(|e| e.name == name)
    }

    pub fn theta_index(&self, name: &str) -> Option<usize> {
        self.thetas.iter().position(|t| t.name == name)
    }

    pub fn covariate_kind(&self, name: &str) -> Option<CovKind> {
        self.covariates
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.kind)
    }

    /// Resolve a surface identifier against the declared symbols.
    pub fn resolve(&self, name: &str) -> Option<Leaf> {
        if self.thetas.iter().any(|t| t.name == name) {
            return Some(Leaf::Theta(name.to_string()));
        }
        if self.etas.iter().any(|e| e.name == name) {
            return Some(Leaf::Eta(name.to_string()));
        }
        if self.epsilons.iter().any(|e| e.name == name) {
            return Some(Leaf::Eps(name.to_string()));
        }
        if self.covariates.iter().any(|c| c.name == name) {
            return Some(Leaf::Covariate(name.to_string()));
        }
        if self.sharedvars.iter().any(|s| s.name == name) {
            return Some(Leaf::Shared(name.to_string()));
        }
        None
    }

    /// All declared names, in declaration-class order. Used by the symbol
    /// table emitter and by name-collision checks.
    pub fn declared_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        names.extend(self.thetas.iter().map(|t| t.name.as_str()));
        names.extend(self.etas.iter().map(|e| e.name.as_str()));
        names.extend(self.epsilons.iter().map(|e| e.name.as_str()));
        names.extend(self.covariates.iter().map(|c| c.name.as_str()));
        names.extend(self.sharedvars.iter().map(|s| s.name.as_str()));
        names
    }
}

/// Fluent, validating constructor for [`ModuleDescriptor`].
///
/// # Example
///
/// ```
/// use pharmtran::model::ModuleBuilder;
///
/// let descriptor = ModuleBuilder::pred()
///     .theta("tvcl", 1.2)
///     .eta("iiv_cl")
///     .eps("prop")
///     .build()
///     .unwrap();
/// assert_eq!(descriptor.n_eta(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    kind: ModuleKind,
    thetas: Vec<Theta>,
    etas: Vec<Eta>,
    epsilons: Vec<Eps>,
    covariates: Vec<Covariate>,
    sharedvars: Vec<SharedVar>,
    cmts: Vec<Compartment>,
    n_cmt: usize,
    advan: u8,
    trans: u8,
    defdose_cmt: usize,
    defobs_cmt: usize,
    solution: Option<SolutionKind>,
}

impl ModuleBuilder {
    fn new(kind: ModuleKind) -> Self {
        ModuleBuilder {
            kind,
            thetas: Vec::new(),
            etas: Vec::new(),
            epsilons: Vec::new(),
            covariates: Vec::new(),
            sharedvars: Vec::new(),
            cmts: Vec::new(),
            n_cmt: 0,
            advan: 0,
            trans: 0,
            defdose_cmt: 0,
            defobs_cmt: 0,
            solution: None,
        }
    }

    /// Direct-prediction model (no compartments).
    pub fn pred() -> Self {
        ModuleBuilder::new(ModuleKind::Pred)
    }

    /// ODE model with `n_cmt` unnamed compartments.
    pub fn ode(n_cmt: usize) -> Self {
        let mut b = ModuleBuilder::new(ModuleKind::Ode);
        b.n_cmt = n_cmt;
        b.cmts = vec![Compartment { name: None }; n_cmt];
        b.advan = 13;
        b.trans = 1;
        b
    }

    /// Closed-form model; compartment count and ADVAN/TRANS come from the
    /// solution metadata.
    pub fn closed_form(kind: SolutionKind) -> Self {
        let meta = kind.meta();
        let mut b = ModuleBuilder::new(ModuleKind::ClosedForm);
        b.n_cmt = meta.n_cmt;
        b.advan = meta.advan;
        b.trans = meta.trans;
        b.defdose_cmt = meta.defdose_cmt;
        b.defobs_cmt = meta.defobs_cmt;
        b.solution = Some(kind);
        b
    }

    pub fn theta(mut self, name: impl Into<String>, init: f64) -> Self {
        self.thetas.push(Theta {
            name: name.into(),
            init,
            lower: None,
            upper: None,
            fixed: false,
        });
        self
    }

    pub fn theta_bounded(
        mut self,
        name: impl Into<String>,
        init: f64,
        lower: f64,
        upper: f64,
    ) -> Self {
        self.thetas.push(Theta {
            name: name.into(),
            init,
            lower: Some(lower),
            upper: Some(upper),
            fixed: false,
        });
        self
    }

    pub fn theta_fixed(mut self, name: impl Into<String>, init: f64) -> Self {
        self.thetas.push(Theta {
            name: name.into(),
            init,
            lower: None,
            upper: None,
            fixed: true,
        });
        self
    }

    pub fn eta(mut self, name: impl Into<String>) -> Self {
        self.etas.push(Eta { name: name.into() });
        self
    }

    pub fn eps(mut self, name: impl Into<String>) -> Self {
        self.epsilons.push(Eps { name: name.into() });
        self
    }

    pub fn covariate(mut self, name: impl Into<String>) -> Self {
        self.covariates.push(Covariate {
            name: name.into(),
            kind: CovKind::Numeric,
        });
        self
    }

    /// Text-typed data column; usable only where a string value is legal.
    pub fn covariate_text(mut self, name: impl Into<String>) -> Self {
        self.covariates.push(Covariate {
            name: name.into(),
            kind: CovKind::Text,
        });
        self
    }

    pub fn shared(mut self, name: impl Into<String>) -> Self {
        self.sharedvars.push(SharedVar { name: name.into() });
        self
    }

    /// Name a compartment (ODE models; applied in declaration order).
    pub fn compartment(mut self, index: usize, name: impl Into<String>) -> Self {
        if let Some(cmt) = self.cmts.get_mut(index) {
            cmt.name = Some(name.into());
        }
        self
    }

    /// Default dosing compartment, 1-based.
    pub fn defdose(mut self, cmt: usize) -> Self {
        self.defdose_cmt = cmt;
        self
    }

    /// Default observation compartment, 1-based.
    pub fn defobs(mut self, cmt: usize) -> Self {
        self.defobs_cmt = cmt;
        self
    }

    pub fn build(self) -> Result<ModuleDescriptor, ModelError> {
        let descriptor = ModuleDescriptor {
            kind: self.kind,
            thetas: self.thetas,
            etas: self.etas,
            epsilons: self.epsilons,
            covariates: self.covariates,
            sharedvars: self.sharedvars,
            cmts: self.cmts,
            n_cmt: self.n_cmt,
            advan: self.advan,
            trans: self.trans,
            defdose_cmt: self.defdose_cmt,
            defobs_cmt: self.defobs_cmt,
            solution: self.solution,
        };
        let mut seen = std::collections::HashSet::new();
        for name in descriptor.declared_names() {
            if !seen.insert(name.to_string()) {
                return Err(ModelError::duplicate_name(name));
            }
        }
        for reserved in ["t", "FIRST_ORDER", "SECOND_ORDER"] {
            if seen.contains(reserved) {
                return Err(ModelError::duplicate_name(reserved));
            }
        }
        if descriptor.defdose_cmt > descriptor.n_cmt {
            return Err(ModelError::UnknownCompartment {
                index: descriptor.defdose_cmt,
                n_cmt: descriptor.n_cmt,
            });
        }
        if descriptor.defobs_cmt > descriptor.n_cmt {
            return Err(ModelError::UnknownCompartment {
                index: descriptor.defobs_cmt,
                n_cmt: descriptor.n_cmt,
            });
        }
        Ok(descriptor)
    }
}
