//! Expression tree for model statements.
//!
//! Expressions are immutable sum-typed trees with shared subtrees (`Arc`).
//! Leaves carry the model-symbol kind (theta, eta, eps, covariate, shared
//! variable, compartment amount, closed-form results) so the later passes
//! never have to re-resolve names against the descriptor. Structural
//! equality and hashing (f64 compared by bit pattern) make subtrees usable
//! as table keys during common-subexpression elimination.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::ops;
use std::sync::Arc;

/// An f64 wrapper with bit-pattern equality and hashing.
///
/// Structural keys need `Eq`; comparing bits keeps `NaN` self-equal and
/// distinguishes `0.0` from `-0.0`, which is what table identity wants.
#[derive(Debug, Clone, Copy)]
pub struct Number(pub f64);

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Number {}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.to_bits());
    }
}

/// A named or positional model symbol appearing in an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Leaf {
    /// Plain model-local variable.
    Local(String),
    /// Fixed-effect parameter.
    Theta(String),
    /// Subject-level random effect (variance in Omega).
    Eta(String),
    /// Observation-level random effect (variance in Sigma).
    Eps(String),
    /// Data column variable.
    Covariate(String),
    /// Shared (population-computed) variable.
    Shared(String),
    /// Compartment amount `A_i`, 0-based.
    Amt(usize),
    /// Closed-form predicted concentration `F`.
    SolvedF,
    /// Closed-form compartment amount.
    SolvedA(usize),
    /// Integration time `t`.
    Time,
    /// Sensitivity-stage guard flags, read from the evaluation context.
    FirstOrder,
    SecondOrder,
}

impl Leaf {
    /// The declared name for named leaves, `None` for positional ones.
    pub fn name(&self) -> Option<&str> {
        match self {
            Leaf::Local(n)
            | Leaf::Theta(n)
            | Leaf::Eta(n)
            | Leaf::Eps(n)
            | Leaf::Covariate(n)
            | Leaf::Shared(n) => Some(n),
            _ => None,
        }
    }
}

/// A variable a derivative can be taken with respect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Wrt {
    Eta(String),
    Eps(String),
    /// Compartment amount (the ODE chain element).
    Amt(usize),
}

impl Wrt {
    pub fn as_leaf(&self) -> Leaf {
        match self {
            Wrt::Eta(n) => Leaf::Eta(n.clone()),
            Wrt::Eps(n) => Leaf::Eps(n.clone()),
            Wrt::Amt(i) => Leaf::Amt(*i),
        }
    }
}

/// What a derivative-table entry is a derivative OF.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DerivOf {
    Local(String),
    Amt(usize),
    SolvedF,
}

/// A reference into the derivative table: ∂of/∂wrt or ∂²of/∂wrt∂wrt2.
///
/// References are symbols, not stored expressions. `Deriv(Local x, η)` reads
/// the derivative local assigned for x earlier in the walk (or 0 if none was
/// ever assigned); `Deriv(Amt i, η)` reads the integrated sensitivity state;
/// `Deriv(SolvedF, η)` reads the closed-form solution handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivRef {
    pub of: DerivOf,
    pub wrt: Wrt,
    pub wrt2: Option<Wrt>,
}

impl DerivRef {
    pub fn first(of: DerivOf, wrt: Wrt) -> Self {
        DerivRef {
            of,
            wrt,
            wrt2: None,
        }
    }

    pub fn second(of: DerivOf, wrt: Wrt, wrt2: Wrt) -> Self {
        DerivRef {
            of,
            wrt,
            wrt2: Some(wrt2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    /// True for comparison and logical operators (Bool-typed results).
    pub fn is_boolean(&self) -> bool {
        matches!(
            self,
            BinOp::Lt
                | BinOp::Le
                | BinOp::Gt
                | BinOp::Ge
                | BinOp::Eq
                | BinOp::Ne
                | BinOp::And
                | BinOp::Or
        )
    }
}

/// Built-in math functions. Never inlined, differentiated by rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Exp,
    Log,
    Log2,
    Log10,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Floor,
    Ceil,
    Pow,
    Min,
    Max,
}

impl Intrinsic {
    pub fn name(&self) -> &'static str {
        match self {
            Intrinsic::Exp => "exp",
            Intrinsic::Log => "log",
            Intrinsic::Log2 => "log2",
            Intrinsic::Log10 => "log10",
            Intrinsic::Sqrt => "sqrt",
            Intrinsic::Abs => "abs",
            Intrinsic::Sin => "sin",
            Intrinsic::Cos => "cos",
            Intrinsic::Tan => "tan",
            Intrinsic::Floor => "floor",
            Intrinsic::Ceil => "ceil",
            Intrinsic::Pow => "pow",
            Intrinsic::Min => "min",
            Intrinsic::Max => "max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "exp" => Intrinsic::Exp,
            "log" => Intrinsic::Log,
            "log2" => Intrinsic::Log2,
            "log10" => Intrinsic::Log10,
            "sqrt" => Intrinsic::Sqrt,
            "abs" => Intrinsic::Abs,
            "sin" => Intrinsic::Sin,
            "cos" => Intrinsic::Cos,
            "tan" => Intrinsic::Tan,
            "floor" => Intrinsic::Floor,
            "ceil" => Intrinsic::Ceil,
            "pow" => Intrinsic::Pow,
            "min" => Intrinsic::Min,
            "max" => Intrinsic::Max,
            _ => return None,
        })
    }

    pub fn arity(&self) -> usize {
        match self {
            Intrinsic::Pow | Intrinsic::Min | Intrinsic::Max => 2,
            _ => 1,
        }
    }
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Num(Number),
    Leaf(Leaf),
    /// Derivative-table reference (see [`DerivRef`]).
    Deriv(DerivRef),
    Unary {
        op: UnaryOp,
        operand: Arc<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Arc<Expr>,
        rhs: Arc<Expr>,
    },
    Func {
        f: Intrinsic,
        args: Vec<Expr>,
    },
    /// User helper call; must be fully removed by the inliner.
    Call {
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Ternary {
        cond: Arc<Expr>,
        then: Arc<Expr>,
        orelse: Arc<Expr>,
    },
}

impl Expr {
    pub fn num(v: f64) -> Self {
        Expr::Num(Number(v))
    }

    pub fn local(name: impl Into<String>) -> Self {
        Expr::Leaf(Leaf::Local(name.into()))
    }

    pub fn theta(name: impl Into<String>) -> Self {
        Expr::Leaf(Leaf::Theta(name.into()))
    }

    pub fn eta(name: impl Into<String>) -> Self {
        Expr::Leaf(Leaf::Eta(name.into()))
    }

    pub fn eps(name: impl Into<String>) -> Self {
        Expr::Leaf(Leaf::Eps(name.into()))
    }

    pub fn covariate(name: impl Into<String>) -> Self {
        Expr::Leaf(Leaf::Covariate(name.into()))
    }

    pub fn amt(i: usize) -> Self {
        Expr::Leaf(Leaf::Amt(i))
    }

    pub fn time() -> Self {
        Expr::Leaf(Leaf::Time)
    }

    pub fn deriv(r: DerivRef) -> Self {
        Expr::Deriv(r)
    }

    pub fn func(f: Intrinsic, args: Vec<Expr>) -> Self {
        Expr::Func { f, args }
    }

    pub fn exp(self) -> Self {
        Expr::Func {
            f: Intrinsic::Exp,
            args: vec![self],
        }
    }

    pub fn log(self) -> Self {
        Expr::Func {
            f: Intrinsic::Log,
            args: vec![self],
        }
    }

    pub fn sqrt(self) -> Self {
        Expr::Func {
            f: Intrinsic::Sqrt,
            args: vec![self],
        }
    }

    pub fn pow(self, exponent: Expr) -> Self {
        Expr::Binary {
            op: BinOp::Pow,
            lhs: Arc::new(self),
            rhs: Arc::new(exponent),
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Arc::new(lhs),
            rhs: Arc::new(rhs),
        }
    }

    pub fn ternary(cond: Expr, then: Expr, orelse: Expr) -> Self {
        Expr::Ternary {
            cond: Arc::new(cond),
            then: Arc::new(then),
            orelse: Arc::new(orelse),
        }
    }

    /// The literal value if this node is a number.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Expr::Num(Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Num(Number(v)) if *v == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Num(Number(v)) if *v == 1.0)
    }

    /// True when the tree contains any leaf or derivative reference at all.
    ///
    /// Pure-constant assignments (no free symbols) get no derivative blocks.
    pub fn has_free_symbols(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Leaf(_) | Expr::Deriv(_)) {
                found = true;
            }
        });
        found
    }

    /// True when the tree references the given leaf anywhere.
    pub fn references(&self, leaf: &Leaf) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Leaf(l) if l == leaf) {
                found = true;
            }
        });
        found
    }

    /// Collect every distinct leaf in the tree.
    pub fn leaves(&self) -> HashSet<Leaf> {
        let mut out = HashSet::new();
        self.walk(&mut |e| {
            if let Expr::Leaf(l) = e {
                out.insert(l.clone());
            }
        });
        out
    }

    /// Visit every node of the tree, parents before children.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Num(_) | Expr::Leaf(_) | Expr::Deriv(_) => {}
            Expr::Unary { operand, .. } => operand.walk(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Func { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            Expr::Call { args, kwargs, .. } => {
                for a in args {
                    a.walk(f);
                }
                for (_, a) in kwargs {
                    a.walk(f);
                }
            }
            Expr::Ternary {
                cond,
                then,
                orelse,
            } => {
                cond.walk(f);
                then.walk(f);
                orelse.walk(f);
            }
        }
    }

    /// Rebuild the tree with every occurrence of `needle` replaced.
    ///
    /// Matching is structural over whole subtrees; untouched branches are
    /// shared, not copied.
    pub fn replace(&self, needle: &Expr, replacement: &Expr) -> Expr {
        if self == needle {
            return replacement.clone();
        }
        match self {
            Expr::Num(_) | Expr::Leaf(_) | Expr::Deriv(_) => self.clone(),
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Arc::new(operand.replace(needle, replacement)),
            },
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Arc::new(lhs.replace(needle, replacement)),
                rhs: Arc::new(rhs.replace(needle, replacement)),
            },
            Expr::Func { f, args } => Expr::Func {
                f: *f,
                args: args.iter().map(|a| a.replace(needle, replacement)).collect(),
            },
            Expr::Call { name, args, kwargs } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|a| a.replace(needle, replacement)).collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(k, a)| (k.clone(), a.replace(needle, replacement)))
                    .collect(),
            },
            Expr::Ternary {
                cond,
                then,
                orelse,
            } => Expr::Ternary {
                cond: Arc::new(cond.replace(needle, replacement)),
                then: Arc::new(then.replace(needle, replacement)),
                orelse: Arc::new(orelse.replace(needle, replacement)),
            },
        }
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        let mut n = 0;
        self.walk(&mut |_| n += 1);
        n
    }
}

impl ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Div, self, rhs)
    }
}

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Neg,
            operand: Arc::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(e: &Expr) -> u64 {
        let mut h = DefaultHasher::new();
        e.hash(&mut h);
        h.finish()
    }

    #[test]
    fn structural_equality_and_hash() {
        let a = Expr::theta("cl") * Expr::eta("iiv_cl").exp();
        let b = Expr::theta("cl") * Expr::eta("iiv_cl").exp();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        let c = Expr::theta("v") * Expr::eta("iiv_cl").exp();
        assert_ne!(a, c);
    }

    #[test]
    fn nan_is_self_equal_for_table_identity() {
        let a = Expr::num(f64::NAN);
        let b = Expr::num(f64::NAN);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn free_symbol_queries() {
        let e = Expr::theta("cl") / Expr::covariate("wt") + Expr::num(2.0);
        assert!(e.has_free_symbols());
        assert!(e.references(&Leaf::Covariate("wt".into())));
        assert!(!e.references(&Leaf::Eta("iiv_cl".into())));
        assert!(!Expr::num(3.5).has_free_symbols());
    }

    #[test]
    fn replace_swaps_whole_subtrees() {
        let shared = Expr::theta("cl") * Expr::eta("iiv_cl").exp();
        let e = shared.clone() + shared.clone().log();
        let replaced = e.replace(&shared, &Expr::local("__0"));
        assert_eq!(
            replaced,
            Expr::local("__0") + Expr::local("__0").log()
        );
    }

    #[test]
    fn deriv_refs_are_hashable_keys() {
        let r1 = DerivRef::first(DerivOf::Local("k".into()), Wrt::Eta("iiv".into()));
        let r2 = DerivRef::first(DerivOf::Local("k".into()), Wrt::Eta("iiv".into()));
        assert_eq!(r1, r2);
        let r3 = DerivRef::second(
            DerivOf::Local("k".into()),
            Wrt::Eta("iiv".into()),
            Wrt::Eta("iov".into()),
        );
        assert_ne!(r1, r3);
    }
}
