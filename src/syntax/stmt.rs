//! Statements of the model body.
//!
//! A model body is an ordered `Vec<Stmt>`; order is semantic and no pass may
//! reorder it. Assignment targets cover the plain-local case plus the
//! compartment surfaces (`dadt`, dosing parameters, solve arguments) and the
//! derivative slots written by the sensitivity pass.

use super::expr::{DerivRef, Expr, Wrt};
use super::span::Span;

/// Per-compartment dosing parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoseParam {
    /// Absorption lag time.
    Alag,
    /// Bioavailable fraction.
    Fraction,
    /// Zero-order dose rate.
    Rate,
    /// Zero-order dose duration.
    Duration,
    /// Initial amount at t0.
    Init,
}

impl DoseParam {
    pub fn name(&self) -> &'static str {
        match self {
            DoseParam::Alag => "alag",
            DoseParam::Fraction => "f",
            DoseParam::Rate => "rate",
            DoseParam::Duration => "dur",
            DoseParam::Init => "init",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "alag" => DoseParam::Alag,
            "f" => DoseParam::Fraction,
            "rate" => DoseParam::Rate,
            "dur" => DoseParam::Duration,
            "init" => DoseParam::Init,
            _ => return None,
        })
    }
}

/// A closed-form solution parameter, optionally per-compartment.
///
/// `K`, `CL`, `V`, `KA` are plain; `ALAG`, `S`, `F`, `R`, `D` carry a 0-based
/// compartment index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamKey {
    pub name: String,
    pub index: Option<usize>,
}

impl ParamKey {
    pub fn plain(name: impl Into<String>) -> Self {
        ParamKey {
            name: name.into(),
            index: None,
        }
    }

    pub fn indexed(name: impl Into<String>, index: usize) -> Self {
        ParamKey {
            name: name.into(),
            index: Some(index),
        }
    }

    /// Stable identifier used in generated code and the normalized text,
    /// e.g. `K` or `ALAG1` (index rendered 1-based for readability).
    pub fn ident(&self) -> String {
        match self.index {
            Some(i) => format!("{}{}", self.name, i + 1),
            None => self.name.clone(),
        }
    }
}

/// How the returned value is to be interpreted by the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Prediction,
    Likelihood,
    NegTwoLogLikelihood,
}

impl ResultKind {
    /// Flag stored next to the result vector.
    pub fn flag(&self) -> u8 {
        match self {
            ResultKind::Prediction => 0,
            ResultKind::Likelihood => 1,
            ResultKind::NegTwoLogLikelihood => 2,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            ResultKind::Prediction => "prediction",
            ResultKind::Likelihood => "likelihood",
            ResultKind::NegTwoLogLikelihood => "neg2ll",
        }
    }
}

/// Left-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssignTarget {
    /// Plain local (includes CSE temps `__0`, `__1`, ...).
    Local(String),
    /// `dadt(i) = ...`
    Dadt(usize),
    /// `cmt(i).alag = ...` and friends.
    DoseParam { cmt: usize, param: DoseParam },
    /// Closed-form solution argument.
    SolveArg(ParamKey),
    /// Derivative slot written by the sensitivity pass.
    Deriv(DerivRef),
    /// Sensitivity row of a `dadt` right-hand side: wrt η (state rows),
    /// wrt `Amt(j)` (the Jacobian), or an η pair (second-order rows).
    DadtWrt {
        cmt: usize,
        wrt: Wrt,
        wrt2: Option<Wrt>,
    },
    /// Dosing-parameter sensitivity.
    DoseParamWrt {
        cmt: usize,
        param: DoseParam,
        wrt: Wrt,
        wrt2: Option<Wrt>,
    },
    /// Solve-argument sensitivity.
    SolveArgWrt {
        key: ParamKey,
        wrt: Wrt,
        wrt2: Option<Wrt>,
    },
    /// Derivative of the return value.
    YWrt { wrt: Wrt, wrt2: Option<Wrt> },
}

impl AssignTarget {
    /// The local name this target binds, if it is a plain local.
    pub fn local_name(&self) -> Option<&str> {
        match self {
            AssignTarget::Local(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    Return {
        value: Expr,
        kind: ResultKind,
    },
    /// Closed-form solve trigger; its arguments are the `SolveArg`
    /// assignments emitted before it.
    Solve,
}

/// A statement with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
    /// Marked `# nodiff`: the value is kept but the sensitivity pass skips it.
    pub nodiff: bool,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Stmt {
            kind,
            span,
            nodiff: false,
        }
    }

    pub fn assign(target: AssignTarget, value: Expr, span: Span) -> Self {
        Stmt::new(StmtKind::Assign { target, value }, span)
    }

    /// Synthesized statement with no source anchor.
    pub fn synthetic(kind: StmtKind) -> Self {
        Stmt::new(kind, Span::default())
    }

    pub fn with_nodiff(mut self, nodiff: bool) -> Self {
        self.nodiff = nodiff;
        self
    }
}

/// An ordered statement sequence.
pub type Block = Vec<Stmt>;
