//! Structural differentiation rules.
//!
//! Derivatives are built bottom-up with the standard sum, product, quotient
//! and chain rules. Construction goes through light smart constructors that
//! drop additive/multiplicative identities and fold numeric pairs, so
//! derivative trees stay readable without a canonicalization pass. No
//! reordering is ever applied; the shape of the input decides the shape of
//! the output.

use std::sync::Arc;

use crate::syntax::expr::{BinOp, Expr, Intrinsic, Leaf, UnaryOp};

// ───────────────────────── Smart constructors ─────────────────────────

/// `a + b` with identities dropped and numeric pairs folded.
pub(crate) fn add(a: Expr, b: Expr) -> Expr {
    if a.is_zero() {
        return b;
    }
    if b.is_zero() {
        return a;
    }
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        return Expr::num(x + y);
    }
    a + b
}

/// `a - b`; `0 - b` becomes a negation.
pub(crate) fn sub(a: Expr, b: Expr) -> Expr {
    if b.is_zero() {
        return a;
    }
    if a.is_zero() {
        return neg(b);
    }
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        return Expr::num(x - y);
    }
    a - b
}

/// `a * b`; zero annihilates, one is dropped.
pub(crate) fn mul(a: Expr, b: Expr) -> Expr {
    if a.is_zero() || b.is_zero() {
        return Expr::num(0.0);
    }
    if a.is_one() {
        return b;
    }
    if b.is_one() {
        return a;
    }
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        return Expr::num(x * y);
    }
    a * b
}

/// `a / b`; a zero numerator short-circuits, a unit denominator is dropped.
pub(crate) fn div(a: Expr, b: Expr) -> Expr {
    if a.is_zero() {
        return Expr::num(0.0);
    }
    if b.is_one() {
        return a;
    }
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        if y != 0.0 {
            return Expr::num(x / y);
        }
    }
    a / b
}

/// `-a` with double negation unwrapped.
pub(crate) fn neg(a: Expr) -> Expr {
    if a.is_zero() {
        return a;
    }
    if let Some(x) = a.as_num() {
        return Expr::num(-x);
    }
    if let Expr::Unary {
        op: UnaryOp::Neg,
        operand,
    } = &a
    {
        return (**operand).clone();
    }
    -a
}

/// `base ^ exponent` with the trivial exponents folded away.
pub(crate) fn pow(base: Expr, exponent: Expr) -> Expr {
    if exponent.is_one() {
        return base;
    }
    if exponent.is_zero() {
        return Expr::num(1.0);
    }
    base.pow(exponent)
}

// ───────────────────────────── Derivatives ─────────────────────────────

/// Derivative of `e` with respect to a leaf.
///
/// Every leaf other than `wrt` is a constant, as is any derivative-table
/// reference (`Deriv` nodes stand for results computed earlier and are
/// opaque here). Boolean operators and the step intrinsics (`floor`,
/// `ceil`) differentiate to zero; `abs`, `min` and `max` pick a branch
/// with a ternary on the usual condition, ignoring the kink itself.
/// Ternaries differentiate branch-wise with the condition held constant.
pub fn diff(e: &Expr, wrt: &Leaf) -> Expr {
    match e {
        Expr::Num(_) => Expr::num(0.0),
        Expr::Leaf(l) => {
            if l == wrt {
                Expr::num(1.0)
            } else {
                Expr::num(0.0)
            }
        }
        Expr::Deriv(_) => Expr::num(0.0),
        Expr::Unary { op, operand } => match op {
            UnaryOp::Neg => neg(diff(operand, wrt)),
            UnaryOp::Not => Expr::num(0.0),
        },
        Expr::Binary { op, lhs, rhs } => diff_binary(*op, lhs, rhs, wrt),
        Expr::Func { f, args } => diff_func(*f, args, wrt),
        // Calls are rejected before differentiation runs; opaque if seen.
        Expr::Call { .. } => Expr::num(0.0),
        Expr::Ternary {
            cond,
            then,
            orelse,
        } => {
            let dt = diff(then, wrt);
            let de = diff(orelse, wrt);
            if dt == de {
                dt
            } else {
                Expr::Ternary {
                    cond: Arc::clone(cond),
                    then: Arc::new(dt),
                    orelse: Arc::new(de),
                }
            }
        }
    }
}

/// Second derivative, `wrt` first and `wrt2` on the result.
pub fn diff2(e: &Expr, wrt: &Leaf, wrt2: &Leaf) -> Expr {
    diff(&diff(e, wrt), wrt2)
}

fn diff_binary(op: BinOp, lhs: &Expr, rhs: &Expr, wrt: &Leaf) -> Expr {
    match op {
        BinOp::Add => add(diff(lhs, wrt), diff(rhs, wrt)),
        BinOp::Sub => sub(diff(lhs, wrt), diff(rhs, wrt)),
        BinOp::Mul => {
            let dl = diff(lhs, wrt);
            let dr = diff(rhs, wrt);
            add(mul(dl, rhs.clone()), mul(lhs.clone(), dr))
        }
        BinOp::Div => {
            let dl = diff(lhs, wrt);
            let dr = diff(rhs, wrt);
            sub(
                div(dl, rhs.clone()),
                div(mul(lhs.clone(), dr), pow(rhs.clone(), Expr::num(2.0))),
            )
        }
        BinOp::Pow => diff_pow(lhs, rhs, wrt),
        // Comparisons and logic are piecewise-constant.
        _ => Expr::num(0.0),
    }
}

fn diff_pow(base: &Expr, exponent: &Expr, wrt: &Leaf) -> Expr {
    let db = diff(base, wrt);
    let de = diff(exponent, wrt);
    if de.is_zero() {
        // d(u^c) = c * u^(c-1) * du
        mul(
            mul(
                exponent.clone(),
                pow(base.clone(), sub(exponent.clone(), Expr::num(1.0))),
            ),
            db,
        )
    } else if db.is_zero() {
        // d(c^v) = c^v * log(c) * dv
        mul(
            mul(pow(base.clone(), exponent.clone()), base.clone().log()),
            de,
        )
    } else {
        // d(u^v) = u^v * (dv * log(u) + v * du / u)
        mul(
            pow(base.clone(), exponent.clone()),
            add(
                mul(de, base.clone().log()),
                div(mul(exponent.clone(), db), base.clone()),
            ),
        )
    }
}

fn diff_func(f: Intrinsic, args: &[Expr], wrt: &Leaf) -> Expr {
    // The parser guards intrinsic arity; hand-built blocks must too.
    debug_assert_eq!(
        args.len(),
        f.arity(),
        "intrinsic '{}' called with {} arguments",
        f.name(),
        args.len()
    );
    match f {
        Intrinsic::Exp => mul(args[0].clone().exp(), diff(&args[0], wrt)),
        Intrinsic::Log => div(diff(&args[0], wrt), args[0].clone()),
        Intrinsic::Log2 => div(
            diff(&args[0], wrt),
            mul(args[0].clone(), Expr::num(std::f64::consts::LN_2)),
        ),
        Intrinsic::Log10 => div(
            diff(&args[0], wrt),
            mul(args[0].clone(), Expr::num(std::f64::consts::LN_10)),
        ),
        Intrinsic::Sqrt => div(
            diff(&args[0], wrt),
            mul(Expr::num(2.0), args[0].clone().sqrt()),
        ),
        Intrinsic::Abs => {
            let sign = Expr::ternary(
                Expr::binary(BinOp::Ge, args[0].clone(), Expr::num(0.0)),
                Expr::num(1.0),
                Expr::num(-1.0),
            );
            mul(sign, diff(&args[0], wrt))
        }
        Intrinsic::Sin => mul(
            Expr::func(Intrinsic::Cos, vec![args[0].clone()]),
            diff(&args[0], wrt),
        ),
        Intrinsic::Cos => neg(mul(
            Expr::func(Intrinsic::Sin, vec![args[0].clone()]),
            diff(&args[0], wrt),
        )),
        Intrinsic::Tan => div(
            diff(&args[0], wrt),
            pow(
                Expr::func(Intrinsic::Cos, vec![args[0].clone()]),
                Expr::num(2.0),
            ),
        ),
        Intrinsic::Floor | Intrinsic::Ceil => Expr::num(0.0),
        Intrinsic::Pow => diff_pow(&args[0], &args[1], wrt),
        Intrinsic::Min => diff_pick(BinOp::Le, args, wrt),
        Intrinsic::Max => diff_pick(BinOp::Ge, args, wrt),
    }
}

/// `min`/`max`: follow whichever argument is active.
fn diff_pick(cmp: BinOp, args: &[Expr], wrt: &Leaf) -> Expr {
    let da = diff(&args[0], wrt);
    let db = diff(&args[1], wrt);
    if da == db {
        return da;
    }
    Expr::ternary(Expr::binary(cmp, args[0].clone(), args[1].clone()), da, db)
}
