//! Helper-function inlining.
//!
//! Model sources may define small helper functions (`fn emax(c, e0, em) {
//! ... return e }`). Before any derivative work, every call is flattened
//! into the caller: the arguments become assignments to callee-scoped
//! locals, the body is spliced in with its locals renamed, and the call
//! node is replaced by a reference to the spliced return local. Expansion
//! is innermost-first, so nested and chained calls settle in one pass and
//! a second pass is a no-op.
//!
//! Renaming uses a `__{fn}__{local}` scheme, with a `__{k}` suffix from the
//! second expansion of the same function onward, so repeated calls cannot
//! collide:
//!
//! ```text
//! z = add(a)          __add__a = a
//!                     __add__b = 1.0
//!                     __add__return = __add__a + __add__b
//!                     z = __add__return
//! ```
//!
//! Definitions carry a stage gate: `Always` definitions expand in every
//! pass, `Preprocess`/`Postprocess` only in the pass of the same name, and
//! `Never` definitions are left for downstream rejection.

use std::collections::HashMap;

use crate::error::InlineError;
use crate::syntax::expr::{Expr, Leaf};
use crate::syntax::span::Span;
use crate::syntax::stmt::{AssignTarget, Block, Stmt, StmtKind};

/// When a definition may be expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InlineStage {
    #[default]
    Always,
    Preprocess,
    Postprocess,
    Never,
}

/// One formal parameter, with an optional default expression.
///
/// Defaults are evaluated in callee scope, so a default may reference an
/// earlier parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Expr) -> Self {
        Param {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// A helper-function definition: parameters, body and stage gate.
///
/// The body is ordinary statement code ending in a single trailing
/// `return`; returns anywhere else are rejected during expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Block,
    pub stage: InlineStage,
}

impl FunctionDef {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        body: Block,
        stage: InlineStage,
    ) -> Self {
        FunctionDef {
            name: name.into(),
            params,
            body,
            stage,
        }
    }
}

/// The set of helper definitions known to one translation.
#[derive(Debug, Clone, Default)]
pub struct FunctionEnv {
    defs: HashMap<String, FunctionDef>,
}

impl FunctionEnv {
    pub fn new() -> Self {
        FunctionEnv::default()
    }

    pub fn define(&mut self, def: FunctionDef) {
        self.defs.insert(def.name.clone(), def);
    }

    /// Fold `other` in; its definitions win on name clashes.
    pub fn merge(&mut self, other: FunctionEnv) {
        self.defs.extend(other.defs);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.defs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }
}

/// Nested expansions beyond this depth are treated as recursion.
const MAX_DEPTH: usize = 64;

/// Expand every eligible call in `block` for the given pass.
pub fn inline_block(
    block: &Block,
    env: &FunctionEnv,
    stage: InlineStage,
) -> Result<Block, InlineError> {
    let mut inliner = Inliner {
        env,
        stage,
        counts: HashMap::new(),
        depth: 0,
    };
    inliner.run(block)
}

/// Reject calls to names that have no definition at all. Calls to known
/// definitions gated to a later stage pass through.
pub fn ensure_known_calls(block: &Block, env: &FunctionEnv) -> Result<(), InlineError> {
    each_call(block, &mut |name, span| {
        if env.get(name).is_none() {
            Err(InlineError::undefined(name, span))
        } else {
            Ok(())
        }
    })
}

/// Reject any remaining call; used after the final inline pass.
pub fn ensure_no_calls(block: &Block) -> Result<(), InlineError> {
    each_call(block, &mut |name, span| Err(InlineError::undefined(name, span)))
}

fn each_call(
    block: &Block,
    f: &mut impl FnMut(&str, Span) -> Result<(), InlineError>,
) -> Result<(), InlineError> {
    fn check(
        expr: &Expr,
        span: Span,
        f: &mut impl FnMut(&str, Span) -> Result<(), InlineError>,
    ) -> Result<(), InlineError> {
        let mut err = None;
        expr.walk(&mut |e| {
            if let Expr::Call { name, .. } = e {
                if err.is_none() {
                    err = f(name, span).err();
                }
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    for stmt in block {
        match &stmt.kind {
            StmtKind::Assign { value, .. } => check(value, stmt.span, f)?,
            StmtKind::Return { value, .. } => check(value, stmt.span, f)?,
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                check(cond, stmt.span, f)?;
                each_call(then_body, f)?;
                each_call(else_body, f)?;
            }
            StmtKind::Solve => {}
        }
    }
    Ok(())
}

struct Inliner<'e> {
    env: &'e FunctionEnv,
    stage: InlineStage,
    /// Expansions performed per function, for suffixing renamed locals.
    counts: HashMap<String, usize>,
    depth: usize,
}

impl Inliner<'_> {
    fn eligible(&self, def: &FunctionDef) -> bool {
        match def.stage {
            InlineStage::Never => false,
            InlineStage::Always => true,
            gated => gated == self.stage,
        }
    }

    fn run(&mut self, block: &Block) -> Result<Block, InlineError> {
        let mut out = Vec::with_capacity(block.len());
        for stmt in block {
            self.stmt(stmt, &mut out)?;
        }
        Ok(out)
    }

    fn stmt(&mut self, stmt: &Stmt, out: &mut Vec<Stmt>) -> Result<(), InlineError> {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                let value = self.expr(value, stmt, out)?;
                out.push(Stmt {
                    kind: StmtKind::Assign {
                        target: target.clone(),
                        value,
                    },
                    span: stmt.span,
                    nodiff: stmt.nodiff,
                });
            }
            StmtKind::Return { value, kind } => {
                let value = self.expr(value, stmt, out)?;
                out.push(Stmt {
                    kind: StmtKind::Return {
                        value,
                        kind: *kind,
                    },
                    span: stmt.span,
                    nodiff: stmt.nodiff,
                });
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                // Splices from the condition land before the `if`; splices
                // from the branches stay inside their branch.
                let cond = self.expr(cond, stmt, out)?;
                let then_body = self.run(then_body)?;
                let else_body = self.run(else_body)?;
                out.push(Stmt {
                    kind: StmtKind::If {
                        cond,
                        then_body,
                        else_body,
                    },
                    span: stmt.span,
                    nodiff: stmt.nodiff,
                });
            }
            StmtKind::Solve => out.push(stmt.clone()),
        }
        Ok(())
    }

    /// Rebuild an expression with children expanded first, then expand the
    /// node itself if it is an eligible call.
    fn expr(
        &mut self,
        expr: &Expr,
        host: &Stmt,
        out: &mut Vec<Stmt>,
    ) -> Result<Expr, InlineError> {
        match expr {
            Expr::Num(_) | Expr::Leaf(_) | Expr::Deriv(_) => Ok(expr.clone()),
            Expr::Unary { op, operand } => Ok(Expr::Unary {
                op: *op,
                operand: std::sync::Arc::new(self.expr(operand, host, out)?),
            }),
            Expr::Binary { op, lhs, rhs } => Ok(Expr::Binary {
                op: *op,
                lhs: std::sync::Arc::new(self.expr(lhs, host, out)?),
                rhs: std::sync::Arc::new(self.expr(rhs, host, out)?),
            }),
            Expr::Func { f, args } => Ok(Expr::Func {
                f: *f,
                args: args
                    .iter()
                    .map(|a| self.expr(a, host, out))
                    .collect::<Result<_, _>>()?,
            }),
            Expr::Ternary {
                cond,
                then,
                orelse,
            } => Ok(Expr::Ternary {
                cond: std::sync::Arc::new(self.expr(cond, host, out)?),
                then: std::sync::Arc::new(self.expr(then, host, out)?),
                orelse: std::sync::Arc::new(self.expr(orelse, host, out)?),
            }),
            Expr::Call { name, args, kwargs } => {
                let args: Vec<Expr> = args
                    .iter()
                    .map(|a| self.expr(a, host, out))
                    .collect::<Result<_, _>>()?;
                let kwargs: Vec<(String, Expr)> = kwargs
                    .iter()
                    .map(|(k, a)| Ok((k.clone(), self.expr(a, host, out)?)))
                    .collect::<Result<_, InlineError>>()?;
                match self.env.get(name) {
                    Some(def) if self.eligible(def) => {
                        let def = def.clone();
                        self.expand(&def, args, kwargs, host, out)
                    }
                    _ => Ok(Expr::Call {
                        name: name.clone(),
                        args,
                        kwargs,
                    }),
                }
            }
        }
    }

    fn expand(
        &mut self,
        def: &FunctionDef,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        host: &Stmt,
        out: &mut Vec<Stmt>,
    ) -> Result<Expr, InlineError> {
        let span = host.span;
        if self.depth >= MAX_DEPTH {
            return Err(InlineError::Recursion {
                name: def.name.clone(),
                span,
            });
        }
        if args.len() > def.params.len() {
            return Err(InlineError::TooManyArguments {
                name: def.name.clone(),
                expected: def.params.len(),
                given: args.len() + kwargs.len(),
                span,
            });
        }
        let mut slots: Vec<Option<Expr>> = vec![None; def.params.len()];
        for (i, a) in args.into_iter().enumerate() {
            slots[i] = Some(a);
        }
        for (kw, e) in kwargs {
            match def.params.iter().position(|p| p.name == kw) {
                None => {
                    return Err(InlineError::unexpected_keyword(&def.name, kw, span));
                }
                Some(i) if slots[i].is_some() => {
                    return Err(InlineError::duplicate_argument(&def.name, kw, span));
                }
                Some(i) => slots[i] = Some(e),
            }
        }

        let k = {
            let c = self.counts.entry(def.name.clone()).or_insert(0);
            let k = *c;
            *c += 1;
            k
        };
        let rename = |local: &str| -> String {
            if k == 0 {
                format!("__{}__{}", def.name, local)
            } else {
                format!("__{}__{}__{}", def.name, local, k)
            }
        };
        let mut map: HashMap<String, String> = HashMap::new();
        for p in &def.params {
            map.insert(p.name.clone(), rename(&p.name));
        }
        collect_assigned(&def.body, &mut |n| {
            if !map.contains_key(n) {
                map.insert(n.to_string(), rename(n));
            }
        });
        let ret_name = rename("return");

        let (body, trailing) = split_trailing_return(def)?;

        // Parameter bindings, in declaration order. Caller argument
        // expressions are already in caller scope; defaults are renamed
        // into callee scope.
        for (i, p) in def.params.iter().enumerate() {
            let bound = match slots[i].take() {
                Some(e) => e,
                None => match &p.default {
                    Some(d) => rename_expr(d, &map),
                    None => {
                        return Err(InlineError::missing_argument(&def.name, &p.name, span));
                    }
                },
            };
            out.push(Stmt {
                kind: StmtKind::Assign {
                    target: AssignTarget::Local(map[&p.name].clone()),
                    value: bound,
                },
                span,
                nodiff: host.nodiff,
            });
        }

        self.depth += 1;
        for s in body {
            let renamed = rename_stmt(s, &map, span, host.nodiff);
            self.stmt(&renamed, out)?;
        }
        let ret_value = match trailing {
            Some(e) => rename_expr(e, &map),
            None => {
                self.depth -= 1;
                return Err(InlineError::MissingReturn {
                    name: def.name.clone(),
                    span,
                });
            }
        };
        let ret_stmt = Stmt {
            kind: StmtKind::Assign {
                target: AssignTarget::Local(ret_name.clone()),
                value: ret_value,
            },
            span,
            nodiff: host.nodiff,
        };
        self.stmt(&ret_stmt, out)?;
        self.depth -= 1;
        Ok(Expr::local(ret_name))
    }
}

/// Split off the single trailing return; any other return is rejected.
fn split_trailing_return(def: &FunctionDef) -> Result<(&[Stmt], Option<&Expr>), InlineError> {
    fn no_returns(block: &[Stmt], name: &str) -> Result<(), InlineError> {
        for s in block {
            match &s.kind {
                StmtKind::Return { .. } => {
                    return Err(InlineError::MidBodyReturn {
                        name: name.to_string(),
                        span: s.span,
                    });
                }
                StmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    no_returns(then_body, name)?;
                    no_returns(else_body, name)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    match def.body.split_last() {
        Some((last, head)) => {
            no_returns(head, &def.name)?;
            match &last.kind {
                StmtKind::Return { value, .. } => Ok((head, Some(value))),
                StmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    no_returns(then_body, &def.name)?;
                    no_returns(else_body, &def.name)?;
                    Ok((&def.body, None))
                }
                _ => Ok((&def.body, None)),
            }
        }
        None => Ok((&def.body, None)),
    }
}

fn rename_expr(expr: &Expr, map: &HashMap<String, String>) -> Expr {
    match expr {
        Expr::Leaf(Leaf::Local(n)) => match map.get(n) {
            Some(renamed) => Expr::local(renamed.clone()),
            None => expr.clone(),
        },
        Expr::Num(_) | Expr::Leaf(_) | Expr::Deriv(_) => expr.clone(),
        Expr::Unary { op, operand } => Expr::Unary {
            op: *op,
            operand: std::sync::Arc::new(rename_expr(operand, map)),
        },
        Expr::Binary { op, lhs, rhs } => Expr::Binary {
            op: *op,
            lhs: std::sync::Arc::new(rename_expr(lhs, map)),
            rhs: std::sync::Arc::new(rename_expr(rhs, map)),
        },
        Expr::Func { f, args } => Expr::Func {
            f: *f,
            args: args.iter().map(|a| rename_expr(a, map)).collect(),
        },
        Expr::Call { name, args, kwargs } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| rename_expr(a, map)).collect(),
            kwargs: kwargs
                .iter()
                .map(|(kw, a)| (kw.clone(), rename_expr(a, map)))
                .collect(),
        },
        Expr::Ternary {
            cond,
            then,
            orelse,
        } => Expr::Ternary {
            cond: std::sync::Arc::new(rename_expr(cond, map)),
            then: std::sync::Arc::new(rename_expr(then, map)),
            orelse: std::sync::Arc::new(rename_expr(orelse, map)),
        },
    }
}

fn rename_stmt(stmt: &Stmt, map: &HashMap<String, String>, span: Span, nodiff: bool) -> Stmt {
    let kind = match &stmt.kind {
        StmtKind::Assign { target, value } => {
            let target = match target {
                AssignTarget::Local(n) => AssignTarget::Local(
                    map.get(n).cloned().unwrap_or_else(|| n.clone()),
                ),
                other => other.clone(),
            };
            StmtKind::Assign {
                target,
                value: rename_expr(value, map),
            }
        }
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => StmtKind::If {
            cond: rename_expr(cond, map),
            then_body: then_body
                .iter()
                .map(|s| rename_stmt(s, map, span, nodiff))
                .collect(),
            else_body: else_body
                .iter()
                .map(|s| rename_stmt(s, map, span, nodiff))
                .collect(),
        },
        StmtKind::Return { value, kind } => StmtKind::Return {
            value: rename_expr(value, map),
            kind: *kind,
        },
        StmtKind::Solve => StmtKind::Solve,
    };
    Stmt {
        kind,
        span,
        nodiff: nodiff || stmt.nodiff,
    }
}

fn collect_assigned(block: &Block, f: &mut impl FnMut(&str)) {
    for s in block {
        match &s.kind {
            StmtKind::Assign {
                target: AssignTarget::Local(n),
                ..
            } => f(n),
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                collect_assigned(then_body, f);
                collect_assigned(else_body, f);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::stmt::ResultKind;
    use crate::syntax::unparse::unparse;

    fn add_def() -> FunctionDef {
        // fn add(a, b = 1) { return a + b }
        FunctionDef::new(
            "add",
            vec![
                Param::required("a"),
                Param::with_default("b", Expr::num(1.0)),
            ],
            vec![Stmt::synthetic(StmtKind::Return {
                value: Expr::local("a") + Expr::local("b"),
                kind: ResultKind::Prediction,
            })],
            InlineStage::Always,
        )
    }

    fn env_with(defs: Vec<FunctionDef>) -> FunctionEnv {
        let mut env = FunctionEnv::new();
        for d in defs {
            env.define(d);
        }
        env
    }

    #[test]
    fn call_expands_to_bindings_body_and_return() {
        let env = env_with(vec![add_def()]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "add".to_string(),
                args: vec![Expr::local("x")],
                kwargs: vec![],
            },
        })];
        let out = inline_block(&body, &env, InlineStage::Always).unwrap();
        let text = unparse(&out);
        assert_eq!(
            text,
            "__add__a = x\n__add__b = 1.0\n__add__return = __add__a + __add__b\nz = __add__return\n"
        );
    }

    #[test]
    fn repeated_calls_get_distinct_suffixes() {
        let env = env_with(vec![add_def()]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "add".to_string(),
                args: vec![Expr::Call {
                    name: "add".to_string(),
                    args: vec![Expr::local("x")],
                    kwargs: vec![],
                }],
                kwargs: vec![],
            },
        })];
        let out = inline_block(&body, &env, InlineStage::Always).unwrap();
        let text = unparse(&out);
        // Inner call first, then the outer one with the `__1` suffix.
        assert!(text.contains("__add__a = x"));
        assert!(text.contains("__add__a__1 = __add__return"));
        assert!(text.contains("z = __add__return__1"));
    }

    #[test]
    fn inlining_is_idempotent() {
        let env = env_with(vec![add_def()]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "add".to_string(),
                args: vec![Expr::local("x"), Expr::num(2.0)],
                kwargs: vec![],
            },
        })];
        let once = inline_block(&body, &env, InlineStage::Always).unwrap();
        let twice = inline_block(&once, &env, InlineStage::Always).unwrap();
        assert_eq!(unparse(&once), unparse(&twice));
    }

    #[test]
    fn keyword_binding_fills_the_named_slot() {
        let env = env_with(vec![add_def()]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "add".to_string(),
                args: vec![Expr::local("x")],
                kwargs: vec![("b".to_string(), Expr::num(3.0))],
            },
        })];
        let out = inline_block(&body, &env, InlineStage::Always).unwrap();
        assert!(unparse(&out).contains("__add__b = 3.0"));
    }

    #[test]
    fn missing_required_argument_errors() {
        let env = env_with(vec![add_def()]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "add".to_string(),
                args: vec![],
                kwargs: vec![],
            },
        })];
        let err = inline_block(&body, &env, InlineStage::Always).unwrap_err();
        assert!(matches!(err, InlineError::MissingArgument { param, .. } if param == "a"));
    }

    #[test]
    fn positional_and_keyword_for_same_slot_errors() {
        let env = env_with(vec![add_def()]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "add".to_string(),
                args: vec![Expr::num(1.0)],
                kwargs: vec![("a".to_string(), Expr::num(2.0))],
            },
        })];
        let err = inline_block(&body, &env, InlineStage::Always).unwrap_err();
        assert!(matches!(err, InlineError::DuplicateArgument { .. }));
    }

    #[test]
    fn mid_body_return_is_rejected() {
        let def = FunctionDef::new(
            "f",
            vec![Param::required("a")],
            vec![
                Stmt::synthetic(StmtKind::Return {
                    value: Expr::local("a"),
                    kind: ResultKind::Prediction,
                }),
                Stmt::synthetic(StmtKind::Assign {
                    target: AssignTarget::Local("x".to_string()),
                    value: Expr::num(1.0),
                }),
            ],
            InlineStage::Always,
        );
        let env = env_with(vec![def]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "f".to_string(),
                args: vec![Expr::num(1.0)],
                kwargs: vec![],
            },
        })];
        let err = inline_block(&body, &env, InlineStage::Always).unwrap_err();
        assert!(matches!(err, InlineError::MidBodyReturn { .. }));
    }

    #[test]
    fn recursion_is_capped() {
        let def = FunctionDef::new(
            "f",
            vec![],
            vec![Stmt::synthetic(StmtKind::Return {
                value: Expr::Call {
                    name: "f".to_string(),
                    args: vec![],
                    kwargs: vec![],
                },
                kind: ResultKind::Prediction,
            })],
            InlineStage::Always,
        );
        let env = env_with(vec![def]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "f".to_string(),
                args: vec![],
                kwargs: vec![],
            },
        })];
        let err = inline_block(&body, &env, InlineStage::Always).unwrap_err();
        assert!(matches!(err, InlineError::Recursion { .. }));
    }

    #[test]
    fn stage_gated_definitions_wait_their_turn() {
        let mut def = add_def();
        def.stage = InlineStage::Postprocess;
        let env = env_with(vec![def]);
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "add".to_string(),
                args: vec![Expr::local("x")],
                kwargs: vec![],
            },
        })];
        let kept = inline_block(&body, &env, InlineStage::Always).unwrap();
        assert_eq!(unparse(&kept), unparse(&body));
        ensure_known_calls(&kept, &env).unwrap();
        let expanded = inline_block(&kept, &env, InlineStage::Postprocess).unwrap();
        assert!(ensure_no_calls(&expanded).is_ok());
    }

    #[test]
    fn branch_splices_stay_inside_their_branch() {
        let env = env_with(vec![add_def()]);
        let body = vec![Stmt::synthetic(StmtKind::If {
            cond: Expr::binary(
                crate::syntax::expr::BinOp::Gt,
                Expr::local("w"),
                Expr::num(0.0),
            ),
            then_body: vec![Stmt::synthetic(StmtKind::Assign {
                target: AssignTarget::Local("z".to_string()),
                value: Expr::Call {
                    name: "add".to_string(),
                    args: vec![Expr::local("x")],
                    kwargs: vec![],
                },
            })],
            else_body: vec![],
        })];
        let out = inline_block(&body, &env, InlineStage::Always).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            StmtKind::If { then_body, .. } => {
                assert_eq!(then_body.len(), 4);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn unknown_call_is_left_for_validation() {
        let env = FunctionEnv::new();
        let body = vec![Stmt::synthetic(StmtKind::Assign {
            target: AssignTarget::Local("z".to_string()),
            value: Expr::Call {
                name: "mystery".to_string(),
                args: vec![],
                kwargs: vec![],
            },
        })];
        let out = inline_block(&body, &env, InlineStage::Always).unwrap();
        let err = ensure_known_calls(&out, &env).unwrap_err();
        assert!(matches!(err, InlineError::Undefined { name, .. } if name == "mystery"));
    }
}
