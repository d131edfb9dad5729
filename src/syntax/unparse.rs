//! Normalized source text for statement sequences.
//!
//! The printer is deterministic: canonical spacing, minimal parenthesization
//! by precedence, 4-space indentation, one statement per line. Derivative
//! slots use a readable bracket form (`__X__[k, eta_cl]`), compartment
//! references are rendered 1-based as in the surface syntax. Parsing the
//! output of `unparse` yields a structurally identical block (modulo spans).

use std::fmt;

use super::expr::{BinOp, DerivOf, Expr, Leaf, UnaryOp, Wrt};
use super::stmt::{AssignTarget, Block, Stmt, StmtKind};

fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Or => 1,
        BinOp::And => 2,
        BinOp::Eq | BinOp::Ne => 3,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
        BinOp::Add | BinOp::Sub => 5,
        BinOp::Mul | BinOp::Div => 6,
        BinOp::Pow => 8,
    }
}

fn op_text(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Pow => "^",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

fn leaf_text(leaf: &Leaf) -> String {
    match leaf {
        Leaf::Local(n)
        | Leaf::Theta(n)
        | Leaf::Eta(n)
        | Leaf::Eps(n)
        | Leaf::Covariate(n)
        | Leaf::Shared(n) => n.clone(),
        Leaf::Amt(i) => format!("a({})", i + 1),
        Leaf::SolvedF => "__F__".to_string(),
        Leaf::SolvedA(i) => format!("__A{}__", i + 1),
        Leaf::Time => "t".to_string(),
        Leaf::FirstOrder => "FIRST_ORDER".to_string(),
        Leaf::SecondOrder => "SECOND_ORDER".to_string(),
    }
}

fn wrt_text(wrt: &Wrt) -> String {
    match wrt {
        Wrt::Eta(n) | Wrt::Eps(n) => n.clone(),
        Wrt::Amt(i) => format!("a({})", i + 1),
    }
}

fn wrt_suffix(wrt: &Wrt, wrt2: &Option<Wrt>) -> String {
    match wrt2 {
        Some(w2) => format!("{}, {}", wrt_text(wrt), wrt_text(w2)),
        None => wrt_text(wrt),
    }
}

/// Render an expression with no outer parentheses.
pub fn expr_text(expr: &Expr) -> String {
    render(expr, 0)
}

fn render(expr: &Expr, min_prec: u8) -> String {
    match expr {
        Expr::Num(n) => {
            let v = n.0;
            if v == v.trunc() && v.is_finite() && v.abs() < 1e15 {
                format!("{:.1}", v)
            } else {
                format!("{}", v)
            }
        }
        Expr::Leaf(l) => leaf_text(l),
        Expr::Deriv(r) => {
            let wrt = wrt_suffix(&r.wrt, &r.wrt2);
            match &r.of {
                DerivOf::Local(n) => format!("__X__[{}, {}]", n, wrt),
                DerivOf::Amt(i) => format!("__A__[{}, {}]", i + 1, wrt),
                DerivOf::SolvedF => format!("__F__[{}]", wrt),
            }
        }
        Expr::Unary { op, operand } => {
            let body = render(operand, 8);
            let text = match op {
                UnaryOp::Neg => format!("-{}", body),
                UnaryOp::Not => format!("!{}", body),
            };
            parenthesize(text, 7, min_prec)
        }
        Expr::Binary { op, lhs, rhs } => {
            let prec = precedence(*op);
            // ^ is right-associative, everything else left-associative.
            let (lp, rp) = if *op == BinOp::Pow {
                (prec + 1, prec)
            } else {
                (prec, prec + 1)
            };
            let text = format!(
                "{} {} {}",
                render(lhs, lp),
                op_text(*op),
                render(rhs, rp)
            );
            parenthesize(text, prec, min_prec)
        }
        Expr::Func { f, args } => {
            let rendered: Vec<String> = args.iter().map(|a| render(a, 0)).collect();
            format!("{}({})", f.name(), rendered.join(", "))
        }
        Expr::Call { name, args, kwargs } => {
            let mut rendered: Vec<String> = args.iter().map(|a| render(a, 0)).collect();
            rendered.extend(
                kwargs
                    .iter()
                    .map(|(k, a)| format!("{} = {}", k, render(a, 0))),
            );
            format!("{}({})", name, rendered.join(", "))
        }
        Expr::Ternary {
            cond,
            then,
            orelse,
        } => {
            let text = format!(
                "{} ? {} : {}",
                render(cond, 1),
                render(then, 1),
                render(orelse, 0)
            );
            parenthesize(text, 0, min_prec)
        }
    }
}

fn parenthesize(text: String, prec: u8, min_prec: u8) -> String {
    if prec < min_prec {
        format!("({})", text)
    } else {
        text
    }
}

/// Render an assignment target.
pub fn target_text(target: &AssignTarget) -> String {
    match target {
        AssignTarget::Local(n) => n.clone(),
        AssignTarget::Dadt(i) => format!("dadt({})", i + 1),
        AssignTarget::DoseParam { cmt, param } => {
            format!("cmt({}).{}", cmt + 1, param.name())
        }
        AssignTarget::SolveArg(key) => format!("solve.{}", key.ident()),
        AssignTarget::Deriv(r) => {
            let wrt = wrt_suffix(&r.wrt, &r.wrt2);
            match &r.of {
                DerivOf::Local(n) => format!("__X__[{}, {}]", n, wrt),
                DerivOf::Amt(i) => format!("__A__[{}, {}]", i + 1, wrt),
                DerivOf::SolvedF => format!("__F__[{}]", wrt),
            }
        }
        AssignTarget::DadtWrt { cmt, wrt, wrt2 } => {
            format!("__DADT__[{}, {}]", cmt + 1, wrt_suffix(wrt, wrt2))
        }
        AssignTarget::DoseParamWrt {
            cmt,
            param,
            wrt,
            wrt2,
        } => format!(
            "__DOSE__[cmt({}).{}, {}]",
            cmt + 1,
            param.name(),
            wrt_suffix(wrt, wrt2)
        ),
        AssignTarget::SolveArgWrt { key, wrt, wrt2 } => {
            format!("__SOLVE__[{}, {}]", key.ident(), wrt_suffix(wrt, wrt2))
        }
        AssignTarget::YWrt { wrt, wrt2 } => {
            format!("__Y__[{}]", wrt_suffix(wrt, wrt2))
        }
    }
}

/// One-line rendering of a statement, used for source-echo comments.
///
/// `If` statements render only their header; their bodies are echoed
/// statement by statement where they are emitted.
pub fn stmt_headline(stmt: &Stmt) -> String {
    match &stmt.kind {
        StmtKind::Assign { target, value } => {
            format!("{} = {}", target_text(target), expr_text(value))
        }
        StmtKind::If { cond, .. } => format!("if ({})", expr_text(cond)),
        StmtKind::Return { value, kind } => {
            format!("return {}({})", kind.keyword(), expr_text(value))
        }
        StmtKind::Solve => "solve()".to_string(),
    }
}

/// Render a whole block as normalized source.
pub fn unparse(block: &Block) -> String {
    let mut out = String::new();
    for stmt in block {
        unparse_stmt(stmt, 0, &mut out);
    }
    out
}

fn unparse_stmt(stmt: &Stmt, depth: usize, out: &mut String) {
    let pad = "    ".repeat(depth);
    match &stmt.kind {
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            out.push_str(&format!("{}if ({}) {{\n", pad, expr_text(cond)));
            for s in then_body {
                unparse_stmt(s, depth + 1, out);
            }
            if !else_body.is_empty() {
                out.push_str(&format!("{}}} else {{\n", pad));
                for s in else_body {
                    unparse_stmt(s, depth + 1, out);
                }
            }
            out.push_str(&format!("{}}}", pad));
            if stmt.nodiff {
                out.push_str("  # nodiff");
            }
            out.push('\n');
        }
        _ => {
            out.push_str(&pad);
            out.push_str(&stmt_headline(stmt));
            if stmt.nodiff {
                out.push_str("  # nodiff");
            }
            out.push('\n');
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", expr_text(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::expr::{DerivRef, DerivOf};
    use crate::syntax::span::Span;

    #[test]
    fn precedence_is_minimal() {
        let e = (Expr::local("a") + Expr::local("b")) * Expr::local("c");
        assert_eq!(expr_text(&e), "(a + b) * c");
        let e = Expr::local("a") + Expr::local("b") * Expr::local("c");
        assert_eq!(expr_text(&e), "a + b * c");
        let e = Expr::local("a") - (Expr::local("b") - Expr::local("c"));
        assert_eq!(expr_text(&e), "a - (b - c)");
    }

    #[test]
    fn pow_binds_tighter_than_neg() {
        let e = -Expr::local("x").pow(Expr::num(2.0));
        assert_eq!(expr_text(&e), "-x ^ 2.0");
        let e = (-Expr::local("x")).pow(Expr::num(2.0));
        assert_eq!(expr_text(&e), "(-x) ^ 2.0");
    }

    #[test]
    fn deriv_refs_render_bracketed() {
        let e = Expr::deriv(DerivRef::first(
            DerivOf::Local("k".into()),
            Wrt::Eta("iiv_cl".into()),
        ));
        assert_eq!(expr_text(&e), "__X__[k, iiv_cl]");
        let e = Expr::deriv(DerivRef::first(DerivOf::Amt(1), Wrt::Eta("iiv_cl".into())));
        assert_eq!(expr_text(&e), "__A__[2, iiv_cl]");
    }

    #[test]
    fn if_blocks_indent() {
        let block = vec![Stmt::new(
            StmtKind::If {
                cond: Expr::binary(BinOp::Gt, Expr::covariate("wt"), Expr::num(70.0)),
                then_body: vec![Stmt::assign(
                    AssignTarget::Local("k".into()),
                    Expr::num(1.0),
                    Span::default(),
                )],
                else_body: vec![],
            },
            Span::default(),
        )];
        let text = unparse(&block);
        assert!(text.starts_with("if (wt > 70.0) {\n    k = 1.0\n}\n"));
    }
}
