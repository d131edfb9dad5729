//! Derivative rows checked against finite differences.
//!
//! A small interpreter evaluates lowered blocks over concrete parameter
//! values: originals and derivative rows run in statement order, guard
//! leaves read the configured flags, and unassigned derivative slots read
//! as zero, exactly as in a generated unit. The recorded rows are then
//! compared against central differences of the same block.

use std::collections::HashMap;

use approx::assert_relative_eq;

use pharmtran::diff::{differentiate, DiffOptions};
use pharmtran::inline::{inline_block, InlineStage};
use pharmtran::syntax::{
    parse_model, unparse, AssignTarget, BinOp, Block, DerivOf, DerivRef, Expr, Intrinsic, Leaf,
    StmtKind, UnaryOp, Wrt,
};
use pharmtran::{ModuleBuilder, ModuleDescriptor, SensitivityOrder};

const H: f64 = 1e-5;
const H_CROSS: f64 = 1e-4;

#[test]
fn eta_rows_match_central_differences() {
    let d = pk_descriptor();
    let block = lower(PK_MODEL, &d, SensitivityOrder::Second);
    let p = pk_point();
    let rows = Machine::evaluate(&block, &p, true, true);

    for eta in ["iiv_cl", "iiv_v"] {
        let analytic = rows.y_row(Wrt::Eta(eta.into()), None);
        let fd = fd_eta(&block, &p, eta);
        assert_relative_eq!(analytic, fd, max_relative = 1e-6, epsilon = 1e-9);
    }
}

#[test]
fn eps_rows_match_central_differences() {
    let d = pk_descriptor();
    let block = lower(PK_MODEL, &d, SensitivityOrder::Second);
    let p = pk_point();
    let rows = Machine::evaluate(&block, &p, true, true);

    let prop = rows.y_row(Wrt::Eps("prop".into()), None);
    assert_relative_eq!(
        prop,
        fd_eps(&block, &p, "prop"),
        max_relative = 1e-6,
        epsilon = 1e-9
    );
    // The additive error enters linearly; its row is exactly one.
    let add = rows.y_row(Wrt::Eps("add".into()), None);
    assert_relative_eq!(add, 1.0, max_relative = 1e-9);
}

#[test]
fn intermediate_rows_differentiate_the_local_itself() {
    let d = pk_descriptor();
    let block = lower(PK_MODEL, &d, SensitivityOrder::Second);
    let p = pk_point();
    let rows = Machine::evaluate(&block, &p, true, true);

    let slot = DerivRef::first(DerivOf::Local("ke".into()), Wrt::Eta("iiv_cl".into()));
    let analytic = rows.slots.get(&slot).copied().unwrap();
    let base = |q: &Point| Machine::evaluate(&block, q, false, false).locals["ke"];
    let fd = (base(&p.nudge_eta("iiv_cl", H)) - base(&p.nudge_eta("iiv_cl", -H))) / (2.0 * H);
    assert_relative_eq!(analytic, fd, max_relative = 1e-6, epsilon = 1e-9);
}

#[test]
fn mixed_rows_match_cross_differences() {
    let d = pk_descriptor();
    let block = lower(PK_MODEL, &d, SensitivityOrder::Second);
    let p = pk_point();
    let rows = Machine::evaluate(&block, &p, true, true);

    let analytic = rows.y_row(Wrt::Eta("iiv_cl".into()), Some(Wrt::Eps("prop".into())));
    let fd = fd_mixed(&block, &p, "iiv_cl", "prop");
    assert_relative_eq!(analytic, fd, max_relative = 1e-4, epsilon = 1e-6);

    // Direct prediction models carry no state, so no pure eta pairs.
    assert!(!rows
        .y_rows
        .keys()
        .any(|(_, wrt2)| matches!(wrt2, Some(Wrt::Eta(_)))));
}

#[test]
fn branch_rows_follow_the_taken_branch() {
    let d = ModuleBuilder::pred()
        .theta("tvcl", 4.0)
        .eta("iiv_cl")
        .eps("prop")
        .covariate("wt")
        .build()
        .unwrap();
    let src = "if (wt > 70.0) {\n\
               \x20   k = tvcl * exp(iiv_cl)\n\
               } else {\n\
               \x20   k = tvcl * exp(2.0 * iiv_cl)\n\
               }\n\
               return k * (1.0 + prop)\n";
    let block = lower(src, &d, SensitivityOrder::Second);

    for wt in [80.0, 60.0] {
        let p = Point {
            theta: map(&[("tvcl", 4.0)]),
            eta: map(&[("iiv_cl", 0.1)]),
            eps: map(&[("prop", 0.02)]),
            cov: map(&[("wt", wt)]),
        };
        let rows = Machine::evaluate(&block, &p, true, true);
        let analytic = rows.y_row(Wrt::Eta("iiv_cl".into()), None);
        let fd = fd_eta(&block, &p, "iiv_cl");
        assert_relative_eq!(analytic, fd, max_relative = 1e-6, epsilon = 1e-9);
    }
}

#[test]
fn nodiff_assignments_contribute_zero_rows() {
    let d = ModuleBuilder::pred()
        .theta("tvcl", 4.0)
        .eta("iiv_cl")
        .eps("prop")
        .build()
        .unwrap();
    let src = "z = tvcl * exp(iiv_cl)  # nodiff\nreturn z * (1.0 + prop)\n";
    let block = lower(src, &d, SensitivityOrder::Second);
    let p = Point {
        theta: map(&[("tvcl", 4.0)]),
        eta: map(&[("iiv_cl", 0.1)]),
        eps: map(&[("prop", 0.02)]),
        cov: HashMap::new(),
    };

    let rows = Machine::evaluate(&block, &p, true, true);
    // The chain reads z's unassigned slot as zero.
    assert_eq!(rows.y_row(Wrt::Eta("iiv_cl".into()), None), 0.0);
    // The value itself still moves with eta.
    assert!(fd_eta(&block, &p, "iiv_cl").abs() > 0.1);
}

#[test]
fn shared_subexpressions_fold_into_temps() {
    let d = ModuleBuilder::pred()
        .theta("tvcl", 4.0)
        .theta("tvv", 70.0)
        .eta("iiv_cl")
        .eps("prop")
        .build()
        .unwrap();
    let src = "cl = tvcl * exp(iiv_cl) + tvv * exp(iiv_cl)\nreturn cl * (1.0 + prop)\n";
    let block = lower(src, &d, SensitivityOrder::Second);

    let text = unparse(&block);
    assert!(text.contains("__0 = exp(iiv_cl)"));
    assert!(text.contains("= tvcl * __0 + tvv * __0"));

    let p = Point {
        theta: map(&[("tvcl", 4.0), ("tvv", 70.0)]),
        eta: map(&[("iiv_cl", 0.1)]),
        eps: map(&[("prop", 0.02)]),
        cov: HashMap::new(),
    };
    let rows = Machine::evaluate(&block, &p, true, true);
    let analytic = rows.y_row(Wrt::Eta("iiv_cl".into()), None);
    let fd = fd_eta(&block, &p, "iiv_cl");
    assert_relative_eq!(analytic, fd, max_relative = 1e-6, epsilon = 1e-9);
}

// ───────────────────────────── Fixtures ─────────────────────────────

const PK_MODEL: &str = "cl = tvcl * exp(iiv_cl) * (wt / 70.0) ^ 0.75\n\
                        v = tvv * exp(iiv_v)\n\
                        ke = cl / v\n\
                        cp = 100.0 / v * exp(-ke * 3.0)\n\
                        return cp * (1.0 + prop) + add\n";

fn pk_descriptor() -> ModuleDescriptor {
    ModuleBuilder::pred()
        .theta("tvcl", 4.0)
        .theta("tvv", 70.0)
        .eta("iiv_cl")
        .eta("iiv_v")
        .eps("prop")
        .eps("add")
        .covariate("wt")
        .build()
        .unwrap()
}

fn pk_point() -> Point {
    Point {
        theta: map(&[("tvcl", 4.0), ("tvv", 70.0)]),
        eta: map(&[("iiv_cl", 0.12), ("iiv_v", -0.2)]),
        eps: map(&[("prop", 0.03), ("add", 0.2)]),
        cov: map(&[("wt", 82.0)]),
    }
}

fn lower(src: &str, d: &ModuleDescriptor, order: SensitivityOrder) -> Block {
    let parsed = parse_model(src, d).unwrap();
    let body = inline_block(&parsed.body, &parsed.functions, InlineStage::Preprocess).unwrap();
    let body = inline_block(&body, &parsed.functions, InlineStage::Always).unwrap();
    differentiate(&body, d, &DiffOptions { order }).unwrap()
}

fn map(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

// ─────────────────────── Finite differences ───────────────────────

fn y_at(block: &Block, p: &Point) -> f64 {
    Machine::evaluate(block, p, false, false).y.unwrap()
}

fn fd_eta(block: &Block, p: &Point, eta: &str) -> f64 {
    (y_at(block, &p.nudge_eta(eta, H)) - y_at(block, &p.nudge_eta(eta, -H))) / (2.0 * H)
}

fn fd_eps(block: &Block, p: &Point, eps: &str) -> f64 {
    (y_at(block, &p.nudge_eps(eps, H)) - y_at(block, &p.nudge_eps(eps, -H))) / (2.0 * H)
}

fn fd_mixed(block: &Block, p: &Point, eta: &str, eps: &str) -> f64 {
    let h = H_CROSS;
    let pp = y_at(block, &p.nudge_eta(eta, h).nudge_eps(eps, h));
    let pm = y_at(block, &p.nudge_eta(eta, h).nudge_eps(eps, -h));
    let mp = y_at(block, &p.nudge_eta(eta, -h).nudge_eps(eps, h));
    let mm = y_at(block, &p.nudge_eta(eta, -h).nudge_eps(eps, -h));
    (pp - pm - mp + mm) / (4.0 * h * h)
}

// ───────────────────────── Interpreter ─────────────────────────

#[derive(Clone)]
struct Point {
    theta: HashMap<String, f64>,
    eta: HashMap<String, f64>,
    eps: HashMap<String, f64>,
    cov: HashMap<String, f64>,
}

impl Point {
    fn nudge_eta(&self, name: &str, dv: f64) -> Point {
        let mut p = self.clone();
        *p.eta.get_mut(name).unwrap() += dv;
        p
    }

    fn nudge_eps(&self, name: &str, dv: f64) -> Point {
        let mut p = self.clone();
        *p.eps.get_mut(name).unwrap() += dv;
        p
    }
}

struct Machine {
    point: Point,
    first_order: bool,
    second_order: bool,
    locals: HashMap<String, f64>,
    slots: HashMap<DerivRef, f64>,
    y: Option<f64>,
    y_rows: HashMap<(Wrt, Option<Wrt>), f64>,
}

impl Machine {
    fn evaluate(block: &Block, point: &Point, first_order: bool, second_order: bool) -> Machine {
        let mut m = Machine {
            point: point.clone(),
            first_order,
            second_order,
            locals: HashMap::new(),
            slots: HashMap::new(),
            y: None,
            y_rows: HashMap::new(),
        };
        m.exec_block(block);
        m
    }

    fn y_row(&self, wrt: Wrt, wrt2: Option<Wrt>) -> f64 {
        self.y_rows[&(wrt, wrt2)]
    }

    /// Returns true once a `return` has run.
    fn exec_block(&mut self, block: &Block) -> bool {
        for stmt in block {
            match &stmt.kind {
                StmtKind::Assign { target, value } => {
                    let v = self.eval(value);
                    match target {
                        AssignTarget::Local(n) => {
                            self.locals.insert(n.clone(), v);
                        }
                        AssignTarget::Deriv(r) => {
                            self.slots.insert(r.clone(), v);
                        }
                        AssignTarget::YWrt { wrt, wrt2 } => {
                            self.y_rows.insert((wrt.clone(), wrt2.clone()), v);
                        }
                        other => panic!("target {:?} outside the pred surface", other),
                    }
                }
                StmtKind::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    let taken = if self.eval(cond) != 0.0 {
                        then_body
                    } else {
                        else_body
                    };
                    if self.exec_block(taken) {
                        return true;
                    }
                }
                StmtKind::Return { value, .. } => {
                    self.y = Some(self.eval(value));
                    return true;
                }
                StmtKind::Solve => panic!("solve() outside the pred surface"),
            }
        }
        false
    }

    fn eval(&self, e: &Expr) -> f64 {
        match e {
            Expr::Num(n) => n.0,
            Expr::Leaf(leaf) => self.leaf(leaf),
            Expr::Deriv(r) => self.slots.get(r).copied().unwrap_or(0.0),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand);
                match op {
                    UnaryOp::Neg => -v,
                    UnaryOp::Not => {
                        if v == 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.eval(lhs);
                let b = self.eval(rhs);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Pow => a.powf(b),
                    BinOp::Lt => bool_num(a < b),
                    BinOp::Le => bool_num(a <= b),
                    BinOp::Gt => bool_num(a > b),
                    BinOp::Ge => bool_num(a >= b),
                    BinOp::Eq => bool_num(a == b),
                    BinOp::Ne => bool_num(a != b),
                    BinOp::And => bool_num(a != 0.0 && b != 0.0),
                    BinOp::Or => bool_num(a != 0.0 || b != 0.0),
                }
            }
            Expr::Func { f, args } => {
                let a = self.eval(&args[0]);
                match f {
                    Intrinsic::Exp => a.exp(),
                    Intrinsic::Log => a.ln(),
                    Intrinsic::Log2 => a.log2(),
                    Intrinsic::Log10 => a.log10(),
                    Intrinsic::Sqrt => a.sqrt(),
                    Intrinsic::Abs => a.abs(),
                    Intrinsic::Sin => a.sin(),
                    Intrinsic::Cos => a.cos(),
                    Intrinsic::Tan => a.tan(),
                    Intrinsic::Floor => a.floor(),
                    Intrinsic::Ceil => a.ceil(),
                    Intrinsic::Pow => a.powf(self.eval(&args[1])),
                    Intrinsic::Min => a.min(self.eval(&args[1])),
                    Intrinsic::Max => a.max(self.eval(&args[1])),
                }
            }
            Expr::Ternary {
                cond,
                then,
                orelse,
            } => {
                if self.eval(cond) != 0.0 {
                    self.eval(then)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Call { name, .. } => panic!("call '{}' survived inlining", name),
        }
    }

    fn leaf(&self, leaf: &Leaf) -> f64 {
        match leaf {
            Leaf::Local(n) => self.locals[n],
            Leaf::Theta(n) => self.point.theta[n],
            Leaf::Eta(n) => self.point.eta[n],
            Leaf::Eps(n) => self.point.eps[n],
            Leaf::Covariate(n) => self.point.cov[n],
            Leaf::FirstOrder => bool_num(self.first_order),
            Leaf::SecondOrder => bool_num(self.second_order),
            other => panic!("leaf {:?} outside the pred surface", other),
        }
    }
}

fn bool_num(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}
