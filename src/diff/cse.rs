//! Common-subexpression elimination for derivative batches.
//!
//! The sensitivity pass hands all derivative expressions of one source
//! statement to [`eliminate`] as a single batch; compound subtrees occurring
//! more than once become `__{n}` temporaries assigned ahead of the batch.
//! Extraction is smallest-subtree-first, so every temporary's body is
//! already written in terms of earlier temporaries and the output list is
//! in assignment order. The numbering counter belongs to the caller and
//! keeps advancing across statements, which keeps temp names unique in the
//! emitted unit.

use std::collections::HashMap;

use crate::syntax::expr::Expr;

/// Result of one elimination batch.
#[derive(Debug)]
pub struct CseRewrite {
    /// `(name, body)` pairs in assignment order.
    pub temps: Vec<(String, Expr)>,
    /// The input expressions with extracted subtrees replaced by locals.
    pub exprs: Vec<Expr>,
}

/// Extract every compound subtree occurring at least twice across `exprs`.
pub fn eliminate(exprs: &[Expr], counter: &mut usize) -> CseRewrite {
    let mut work: Vec<Expr> = exprs.to_vec();
    let mut temps: Vec<(String, Expr)> = Vec::new();
    loop {
        let candidate = match best_candidate(&work) {
            Some(c) => c,
            None => break,
        };
        let name = format!("__{}", *counter);
        *counter += 1;
        let local = Expr::local(name.clone());
        for e in &mut work {
            *e = e.replace(&candidate, &local);
        }
        temps.push((name, candidate));
    }
    CseRewrite { temps, exprs: work }
}

/// The smallest extractable subtree seen at least twice; ties go to the
/// earliest first occurrence. Pre-order traversal makes both deterministic.
fn best_candidate(exprs: &[Expr]) -> Option<Expr> {
    let mut counts: HashMap<Expr, usize> = HashMap::new();
    let mut order: Vec<Expr> = Vec::new();
    for e in exprs {
        e.walk(&mut |node| {
            if !extractable(node) {
                return;
            }
            let n = counts.entry(node.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                order.push(node.clone());
            }
        });
    }
    let mut best: Option<&Expr> = None;
    for c in &order {
        if counts[c] < 2 {
            continue;
        }
        match best {
            Some(b) if b.size() <= c.size() => {}
            _ => best = Some(c),
        }
    }
    best.cloned()
}

fn is_atom(e: &Expr) -> bool {
    matches!(e, Expr::Num(_) | Expr::Leaf(_) | Expr::Deriv(_))
}

/// Whether a subtree earns a temporary. Atoms never do; a bare negation or
/// a constant-scaled atom stays inline.
fn extractable(e: &Expr) -> bool {
    match e {
        Expr::Num(_) | Expr::Leaf(_) | Expr::Deriv(_) => false,
        Expr::Unary { operand, .. } => !is_atom(operand),
        Expr::Binary { lhs, rhs, .. } => {
            !(matches!(**lhs, Expr::Num(_)) && is_atom(rhs))
                && !(is_atom(lhs) && matches!(**rhs, Expr::Num(_)))
        }
        Expr::Func { .. } | Expr::Call { .. } | Expr::Ternary { .. } => true,
    }
}
