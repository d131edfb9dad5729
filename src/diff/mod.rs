//! Sensitivity expansion.
//!
//! The pass walks an inlined statement block in order and, after each
//! statement, appends the derivative assignments an estimator needs:
//! first-order sensitivities w.r.t. every η and ε, mixed (η, ε) second
//! order, and the lower triangle of pure (η, η) second order. Derivative
//! blocks are wrapped in runtime guards (`FIRST_ORDER`, `SECOND_ORDER`) so
//! one emitted unit serves every estimation mode.
//!
//! Chain terms multiply by derivative-table REFERENCES, never by
//! substituted expressions: `Deriv(cl, η)` names whatever assignment the
//! walk produced for `cl` earlier, and a reference that was never assigned
//! renders as literal `0.0` downstream. Together with the running scope
//! this reproduces the statement-ordered semantics of the surface language,
//! including its branch-local quirk: names first assigned under an `if`
//! keep only the per-branch table entries, and the `0.0` fallback covers
//! the gaps. Do not merge entries across branches.

mod cse;
mod rules;

pub use rules::{diff, diff2};

use crate::error::DiffError;
use crate::model::{ModuleDescriptor, ModuleKind};
use crate::syntax::expr::{DerivOf, DerivRef, Expr, Leaf, Wrt};
use crate::syntax::span::Span;
use crate::syntax::stmt::{AssignTarget, Block, DoseParam, ParamKey, ResultKind, Stmt, StmtKind};

use cse::eliminate;
use rules::{add, mul};

/// How deep the emitted sensitivity blocks go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensitivityOrder {
    /// First-order blocks only.
    First,
    /// First- and second-order blocks.
    #[default]
    Second,
}

/// Options for the sensitivity pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub order: SensitivityOrder,
}

// ─────────────────────────────── Scope ───────────────────────────────

/// Insertion-ordered set of the locals defined so far.
///
/// Chain sums iterate definition order, which keeps output deterministic
/// down to the CSE temp numbering.
#[derive(Debug, Clone, Default)]
struct Scope {
    names: Vec<String>,
}

impl Scope {
    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    fn define(&mut self, name: &str) {
        if !self.contains(name) {
            self.names.push(name.to_string());
        }
    }

    /// Fold a branch scope back in, keeping first-seen order.
    fn absorb(&mut self, branch: Scope) {
        for n in branch.names {
            if !self.contains(&n) {
                self.names.push(n);
            }
        }
    }

    /// The defined locals free in `value`, in definition order.
    fn chain_locals(&self, value: &Expr) -> Vec<String> {
        let free = value.leaves();
        self.names
            .iter()
            .filter(|n| free.contains(&Leaf::Local((*n).clone())))
            .cloned()
            .collect()
    }
}

// ──────────────────────────── Validation ────────────────────────────

/// Check every read of a plain local against the definitions preceding it.
///
/// Both bodies of an `if` start from the scope at the `if`; afterwards the
/// definitions of either branch are visible, whichever branch runs.
pub fn validate_scope(block: &Block) -> Result<(), DiffError> {
    let mut scope = Scope::default();
    validate_block(block, &mut scope)
}

fn validate_block(block: &Block, scope: &mut Scope) -> Result<(), DiffError> {
    for stmt in block {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                check_reads(value, scope, stmt.span)?;
                if let Some(name) = target.local_name() {
                    scope.define(name);
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                check_reads(cond, scope, stmt.span)?;
                let mut then_scope = scope.clone();
                validate_block(then_body, &mut then_scope)?;
                let mut else_scope = scope.clone();
                validate_block(else_body, &mut else_scope)?;
                scope.absorb(then_scope);
                scope.absorb(else_scope);
            }
            StmtKind::Return { value, .. } => check_reads(value, scope, stmt.span)?,
            StmtKind::Solve => {}
        }
    }
    Ok(())
}

fn check_reads(value: &Expr, scope: &Scope, span: Span) -> Result<(), DiffError> {
    let mut undefined: Option<String> = None;
    value.walk(&mut |e| {
        if undefined.is_some() {
            return;
        }
        if let Expr::Leaf(Leaf::Local(name)) = e {
            if !scope.contains(name) {
                undefined = Some(name.clone());
            }
        }
    });
    match undefined {
        Some(name) => Err(DiffError::use_before_definition(name, span)),
        None => Ok(()),
    }
}

/// Non-intrinsic calls cannot be differentiated; anything the inliner left
/// in a differentiated value is reported against the statement.
fn check_calls(value: &Expr, span: Span) -> Result<(), DiffError> {
    let mut unknown: Option<String> = None;
    value.walk(&mut |e| {
        if unknown.is_none() {
            if let Expr::Call { name, .. } = e {
                unknown = Some(name.clone());
            }
        }
    });
    match unknown {
        Some(name) => Err(DiffError::undefined_function(name, span)),
        None => Ok(()),
    }
}

// ──────────────────────────── Expansion ────────────────────────────

/// Expand `block` with derivative assignments after every statement.
///
/// `block` must already be inlined; statements carrying derivative targets
/// are rejected (the pass does not run on its own output). The source
/// statements themselves are kept untouched, in order.
pub fn differentiate(
    block: &Block,
    descriptor: &ModuleDescriptor,
    opts: &DiffOptions,
) -> Result<Block, DiffError> {
    validate_scope(block)?;
    let mut pass = DiffPass {
        descriptor,
        order: opts.order,
        temp_counter: 0,
    };
    let mut scope = Scope::default();
    pass.expand_block(block, &mut scope, false)
}

/// Derivative expressions of one statement, in generation order.
struct EntrySet {
    /// First order: every η in declaration order, then every ε, then the
    /// per-amount entries (ODE).
    first: Vec<(Wrt, Expr)>,
    /// Second order, per outer η: the (η, η_v≤η) pairs, then the (η, ε)
    /// pairs.
    second: Vec<(Wrt, Wrt, Expr)>,
}

/// Where one statement's derivative assignments are addressed.
enum TargetShape {
    Local(String),
    Dadt(usize),
    Dose { cmt: usize, param: DoseParam },
    SolveArg(ParamKey),
    Y,
}

impl TargetShape {
    fn target(&self, wrt: Wrt, wrt2: Option<Wrt>) -> AssignTarget {
        match self {
            TargetShape::Local(name) => AssignTarget::Deriv(DerivRef {
                of: DerivOf::Local(name.clone()),
                wrt,
                wrt2,
            }),
            TargetShape::Dadt(cmt) => AssignTarget::DadtWrt {
                cmt: *cmt,
                wrt,
                wrt2,
            },
            TargetShape::Dose { cmt, param } => AssignTarget::DoseParamWrt {
                cmt: *cmt,
                param: *param,
                wrt,
                wrt2,
            },
            TargetShape::SolveArg(key) => AssignTarget::SolveArgWrt {
                key: key.clone(),
                wrt,
                wrt2,
            },
            TargetShape::Y => AssignTarget::YWrt { wrt, wrt2 },
        }
    }
}

struct DiffPass<'a> {
    descriptor: &'a ModuleDescriptor,
    order: SensitivityOrder,
    /// CSE temp counter; advances across the whole unit.
    temp_counter: usize,
}

impl<'a> DiffPass<'a> {
    fn expand_block(
        &mut self,
        block: &Block,
        scope: &mut Scope,
        suppress: bool,
    ) -> Result<Block, DiffError> {
        let mut out = Vec::new();
        for stmt in block {
            self.expand_stmt(stmt, scope, suppress, &mut out)?;
        }
        Ok(out)
    }

    fn expand_stmt(
        &mut self,
        stmt: &Stmt,
        scope: &mut Scope,
        suppress: bool,
        out: &mut Block,
    ) -> Result<(), DiffError> {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                self.expand_assign(stmt, target, value, scope, suppress, out)
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let nested = suppress || stmt.nodiff;
                let mut then_scope = scope.clone();
                let then_b = self.expand_block(then_body, &mut then_scope, nested)?;
                let mut else_scope = scope.clone();
                let else_b = self.expand_block(else_body, &mut else_scope, nested)?;
                scope.absorb(then_scope);
                scope.absorb(else_scope);
                out.push(Stmt {
                    kind: StmtKind::If {
                        cond: cond.clone(),
                        then_body: then_b,
                        else_body: else_b,
                    },
                    span: stmt.span,
                    nodiff: stmt.nodiff,
                });
                Ok(())
            }
            StmtKind::Return { value, kind } => {
                self.expand_return(stmt, value, *kind, scope, suppress, out)
            }
            StmtKind::Solve => {
                out.push(stmt.clone());
                Ok(())
            }
        }
    }

    fn expand_assign(
        &mut self,
        stmt: &Stmt,
        target: &AssignTarget,
        value: &Expr,
        scope: &mut Scope,
        suppress: bool,
        out: &mut Block,
    ) -> Result<(), DiffError> {
        let (shape, wrt_eps, temps_inside) = match target {
            AssignTarget::Local(name) => (TargetShape::Local(name.clone()), true, true),
            AssignTarget::Dadt(cmt) => (TargetShape::Dadt(*cmt), false, true),
            AssignTarget::DoseParam { cmt, param } => (
                TargetShape::Dose {
                    cmt: *cmt,
                    param: *param,
                },
                false,
                false,
            ),
            AssignTarget::SolveArg(key) => (TargetShape::SolveArg(key.clone()), false, false),
            AssignTarget::Deriv(_)
            | AssignTarget::DadtWrt { .. }
            | AssignTarget::DoseParamWrt { .. }
            | AssignTarget::SolveArgWrt { .. }
            | AssignTarget::YWrt { .. } => {
                return Err(DiffError::InvalidAssignTarget { span: stmt.span });
            }
        };
        out.push(stmt.clone());
        if !(suppress || stmt.nodiff || !value.has_free_symbols()) {
            check_calls(value, stmt.span)?;
            let entries = self.entries(value, scope, wrt_eps);
            self.emit_guarded(entries, &shape, temps_inside, stmt.span, out);
        }
        if let Some(name) = target.local_name() {
            scope.define(name);
        }
        Ok(())
    }

    fn expand_return(
        &mut self,
        stmt: &Stmt,
        value: &Expr,
        _kind: ResultKind,
        scope: &mut Scope,
        suppress: bool,
        out: &mut Block,
    ) -> Result<(), DiffError> {
        // Derivative blocks go in front: the return terminates the unit.
        if !(suppress || stmt.nodiff || !value.has_free_symbols()) {
            check_calls(value, stmt.span)?;
            let entries = self.entries(value, scope, true);
            self.emit_guarded(entries, &TargetShape::Y, true, stmt.span, out);
        }
        out.push(stmt.clone());
        Ok(())
    }

    /// Build every derivative expression for one statement value.
    ///
    /// `wrt_eps` is off for `dadt`, dosing-parameter and solve-argument
    /// statements: ε does not flow into state or dosing, so those get η
    /// (and per-amount) entries only, and no mixed block.
    fn entries(&self, value: &Expr, scope: &Scope, wrt_eps: bool) -> EntrySet {
        let chain = scope.chain_locals(value);
        let mut first = Vec::new();
        let mut second = Vec::new();

        for (u, eta) in self.descriptor.etas.iter().enumerate() {
            let wrt = Wrt::Eta(eta.name.clone());
            let d1 = self.first_order(value, &wrt, &chain);
            if self.order == SensitivityOrder::Second {
                for v in 0..=u {
                    let wrt2 = Wrt::Eta(self.descriptor.etas[v].name.clone());
                    if let Some(z) = self.second_order(value, &wrt, &wrt2, &chain) {
                        second.push((wrt.clone(), wrt2, z));
                    }
                }
                if wrt_eps {
                    for eps in &self.descriptor.epsilons {
                        let wrt2 = Wrt::Eps(eps.name.clone());
                        let z = self.mixed_order(&d1, &wrt2, &chain);
                        second.push((wrt.clone(), wrt2, z));
                    }
                }
            }
            first.push((wrt, d1));
        }

        if wrt_eps {
            for eps in &self.descriptor.epsilons {
                let wrt = Wrt::Eps(eps.name.clone());
                let d1 = self.first_order(value, &wrt, &chain);
                first.push((wrt, d1));
            }
        }

        // Per-amount entries: the state rows later statements (and the
        // integrator Jacobian) chain through.
        if self.descriptor.kind == ModuleKind::Ode {
            for i in 0..self.descriptor.n_cmt {
                let mut d = diff(value, &Leaf::Amt(i));
                for s in &chain {
                    d = add(
                        d,
                        mul(
                            diff(value, &Leaf::Local(s.clone())),
                            Expr::deriv(DerivRef::first(DerivOf::Local(s.clone()), Wrt::Amt(i))),
                        ),
                    );
                }
                first.push((Wrt::Amt(i), d));
            }
        }

        EntrySet { first, second }
    }

    /// First-order sensitivity w.r.t. one η or ε: the direct derivative,
    /// the state (or solution) chain for η, and the chain through every
    /// in-scope local free in the value.
    fn first_order(&self, value: &Expr, wrt: &Wrt, chain: &[String]) -> Expr {
        let wrt_leaf = wrt.as_leaf();
        let mut d = diff(value, &wrt_leaf);
        if matches!(wrt, Wrt::Eta(_)) {
            match self.descriptor.kind {
                ModuleKind::Ode => {
                    for i in 0..self.descriptor.n_cmt {
                        d = add(
                            d,
                            mul(
                                diff(value, &Leaf::Amt(i)),
                                Expr::deriv(DerivRef::first(DerivOf::Amt(i), wrt.clone())),
                            ),
                        );
                    }
                }
                ModuleKind::ClosedForm => {
                    d = add(
                        d,
                        mul(
                            diff(value, &Leaf::SolvedF),
                            Expr::deriv(DerivRef::first(DerivOf::SolvedF, wrt.clone())),
                        ),
                    );
                    for i in 0..self.descriptor.n_cmt {
                        d = add(
                            d,
                            mul(
                                diff(value, &Leaf::SolvedA(i)),
                                Expr::deriv(DerivRef::first(DerivOf::Amt(i), wrt.clone())),
                            ),
                        );
                    }
                }
                ModuleKind::Pred => {}
            }
        }
        for s in chain {
            let ds = diff(value, &Leaf::Local(s.clone()));
            d = add(
                d,
                mul(
                    ds.clone(),
                    Expr::deriv(DerivRef::first(DerivOf::Local(s.clone()), wrt.clone())),
                ),
            );
            if matches!(wrt, Wrt::Eta(_)) && self.descriptor.kind == ModuleKind::Ode {
                for i in 0..self.descriptor.n_cmt {
                    d = add(
                        d,
                        mul(
                            mul(
                                ds.clone(),
                                Expr::deriv(DerivRef::first(DerivOf::Local(s.clone()), Wrt::Amt(i))),
                            ),
                            Expr::deriv(DerivRef::first(DerivOf::Amt(i), wrt.clone())),
                        ),
                    );
                }
            }
        }
        d
    }

    /// Mixed (η, ε) second order: the ε-derivative of the completed
    /// first-order expression, chained through in-scope locals.
    fn mixed_order(&self, d1: &Expr, wrt2: &Wrt, chain: &[String]) -> Expr {
        let mut z = diff(d1, &wrt2.as_leaf());
        for s in chain {
            z = add(
                z,
                mul(
                    diff(d1, &Leaf::Local(s.clone())),
                    Expr::deriv(DerivRef::first(DerivOf::Local(s.clone()), wrt2.clone())),
                ),
            );
        }
        z
    }

    /// Pure (η, η) second order. `None` for `Pred` modules, which carry no
    /// state to chain second derivatives through.
    fn second_order(&self, value: &Expr, u: &Wrt, v: &Wrt, chain: &[String]) -> Option<Expr> {
        let lu = u.as_leaf();
        let lv = v.as_leaf();
        let mut z = match self.descriptor.kind {
            ModuleKind::Pred => return None,
            ModuleKind::Ode => {
                let mut z = diff2(value, &lu, &lv);
                for i in 0..self.descriptor.n_cmt {
                    let ai = Leaf::Amt(i);
                    z = add(
                        z,
                        mul(
                            diff2(value, &lu, &ai),
                            Expr::deriv(DerivRef::first(DerivOf::Amt(i), v.clone())),
                        ),
                    );
                    z = add(
                        z,
                        mul(
                            diff2(value, &lv, &ai),
                            Expr::deriv(DerivRef::first(DerivOf::Amt(i), u.clone())),
                        ),
                    );
                    for j in 0..self.descriptor.n_cmt {
                        z = add(
                            z,
                            mul(
                                mul(
                                    diff2(value, &ai, &Leaf::Amt(j)),
                                    Expr::deriv(DerivRef::first(DerivOf::Amt(j), u.clone())),
                                ),
                                Expr::deriv(DerivRef::first(DerivOf::Amt(i), v.clone())),
                            ),
                        );
                    }
                    z = add(
                        z,
                        mul(
                            diff(value, &ai),
                            Expr::deriv(DerivRef::second(DerivOf::Amt(i), u.clone(), v.clone())),
                        ),
                    );
                }
                z
            }
            ModuleKind::ClosedForm => {
                let fu = Expr::deriv(DerivRef::first(DerivOf::SolvedF, u.clone()));
                let fv = Expr::deriv(DerivRef::first(DerivOf::SolvedF, v.clone()));
                let mut z = diff2(value, &lu, &lv);
                z = add(z, mul(diff2(value, &lu, &Leaf::SolvedF), fv.clone()));
                z = add(z, mul(diff2(value, &lv, &Leaf::SolvedF), fu.clone()));
                z = add(
                    z,
                    mul(
                        mul(diff2(value, &Leaf::SolvedF, &Leaf::SolvedF), fu.clone()),
                        fv.clone(),
                    ),
                );
                z = add(
                    z,
                    mul(
                        diff(value, &Leaf::SolvedF),
                        Expr::deriv(DerivRef::second(DerivOf::SolvedF, u.clone(), v.clone())),
                    ),
                );
                for i in 0..self.descriptor.n_cmt {
                    let sai = Leaf::SolvedA(i);
                    let aiu = Expr::deriv(DerivRef::first(DerivOf::Amt(i), u.clone()));
                    let aiv = Expr::deriv(DerivRef::first(DerivOf::Amt(i), v.clone()));
                    z = add(z, mul(diff2(value, &lu, &sai), aiv.clone()));
                    z = add(z, mul(diff2(value, &lv, &sai), aiu.clone()));
                    z = add(
                        z,
                        mul(
                            diff2(value, &Leaf::SolvedF, &sai),
                            add(mul(fu.clone(), aiv.clone()), mul(fv.clone(), aiu)),
                        ),
                    );
                    for j in 0..self.descriptor.n_cmt {
                        z = add(
                            z,
                            mul(
                                mul(
                                    diff2(value, &sai, &Leaf::SolvedA(j)),
                                    Expr::deriv(DerivRef::first(DerivOf::Amt(j), u.clone())),
                                ),
                                aiv.clone(),
                            ),
                        );
                    }
                    z = add(
                        z,
                        mul(
                            diff(value, &sai),
                            Expr::deriv(DerivRef::second(DerivOf::Amt(i), u.clone(), v.clone())),
                        ),
                    );
                }
                z
            }
        };
        for s in chain {
            let ls = Leaf::Local(s.clone());
            z = add(
                z,
                mul(
                    diff2(value, &lu, &ls),
                    Expr::deriv(DerivRef::first(DerivOf::Local(s.clone()), v.clone())),
                ),
            );
            z = add(
                z,
                mul(
                    diff(value, &ls),
                    Expr::deriv(DerivRef::second(DerivOf::Local(s.clone()), u.clone(), v.clone())),
                ),
            );
        }
        Some(z)
    }

    /// Run CSE over the entry expressions and append the guarded blocks.
    ///
    /// Temps sit inside the FIRST_ORDER guard except for dosing-parameter
    /// and solve-argument statements, whose temps go before it. Guards with
    /// nothing inside are not emitted.
    fn emit_guarded(
        &mut self,
        entries: EntrySet,
        shape: &TargetShape,
        temps_inside: bool,
        span: Span,
        out: &mut Block,
    ) {
        let EntrySet { first, second } = entries;
        if first.is_empty() && second.is_empty() {
            return;
        }
        let exprs: Vec<Expr> = first
            .iter()
            .map(|(_, e)| e.clone())
            .chain(second.iter().map(|(_, _, e)| e.clone()))
            .collect();
        let rewrite = eliminate(&exprs, &mut self.temp_counter);
        let mut rewritten = rewrite.exprs.into_iter();
        let first_rw: Vec<(Wrt, Expr)> = first
            .into_iter()
            .zip(rewritten.by_ref())
            .map(|((wrt, _), e)| (wrt, e))
            .collect();
        let second_rw: Vec<(Wrt, Wrt, Expr)> = second
            .into_iter()
            .zip(rewritten)
            .map(|((u, v, _), e)| (u, v, e))
            .collect();

        let temps: Vec<Stmt> = rewrite
            .temps
            .into_iter()
            .map(|(name, body)| Stmt::assign(AssignTarget::Local(name), body, span))
            .collect();

        let mut guarded: Block = Vec::new();
        if temps_inside {
            guarded.extend(temps);
        } else {
            out.extend(temps);
        }
        for (wrt, e) in first_rw {
            guarded.push(Stmt::assign(shape.target(wrt, None), e, span));
        }
        let mut second_body: Block = Vec::new();
        for (u, v, e) in second_rw {
            let mixed = matches!(v, Wrt::Eps(_));
            let stmt = Stmt::assign(shape.target(u, Some(v)), e, span);
            if mixed {
                guarded.push(stmt);
            } else {
                second_body.push(stmt);
            }
        }
        if !second_body.is_empty() {
            guarded.push(Stmt::new(
                StmtKind::If {
                    cond: Expr::Leaf(Leaf::SecondOrder),
                    then_body: second_body,
                    else_body: Vec::new(),
                },
                span,
            ));
        }
        if !guarded.is_empty() {
            out.push(Stmt::new(
                StmtKind::If {
                    cond: Expr::Leaf(Leaf::FirstOrder),
                    then_body: guarded,
                    else_body: Vec::new(),
                },
                span,
            ));
        }
    }
}
