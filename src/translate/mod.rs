//! End-to-end translation: model text in, native unit out.
//!
//! [`Translator`] wires the stages in order: parse (when starting from
//! text), preprocess- and always-stage inlining, scope validation,
//! sensitivity expansion, postprocess inlining, then typing and emission.
//! The first failing stage aborts the run.
//!
//! Translation is pure. No global state, no I/O, and the same input
//! produces the same output text, down to derivative-slot and CSE-temp
//! numbering.

use crate::codegen::{emit_unit, GeneratedUnit};
use crate::diff::{differentiate, DiffOptions, SensitivityOrder};
use crate::error::{ParseError, TranError};
use crate::inline::{
    ensure_known_calls, ensure_no_calls, inline_block, FunctionEnv, InlineStage,
};
use crate::model::{ModuleDescriptor, OdeSolver};
use crate::syntax::{parse_model, unparse, Block, Span};

/// Result of one translation run.
#[derive(Debug, Clone)]
pub struct Translation {
    /// The fully lowered model in source form, sensitivity rows included.
    pub normalized: String,
    /// The emitted native unit with its symbol table.
    pub unit: GeneratedUnit,
}

/// Configures and runs one translation.
#[derive(Debug, Clone)]
pub struct Translator {
    descriptor: ModuleDescriptor,
    functions: FunctionEnv,
    order: SensitivityOrder,
    solver: OdeSolver,
    source: Option<String>,
    body: Option<Block>,
}

impl Translator {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Translator {
            descriptor,
            functions: FunctionEnv::new(),
            order: SensitivityOrder::default(),
            solver: OdeSolver::default(),
            source: None,
            body: None,
        }
    }

    /// Register helper definitions visible to every pass. Definitions
    /// parsed from the source win on name clashes.
    pub fn with_functions(mut self, functions: FunctionEnv) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_order(mut self, order: SensitivityOrder) -> Self {
        self.order = order;
        self
    }

    /// Solver settings baked into the unit as configuration literals.
    pub fn with_solver(mut self, solver: OdeSolver) -> Self {
        self.solver = solver;
        self
    }

    /// Translate from model text; `fn` items in the text are collected.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self.body = None;
        self
    }

    /// Translate from an already-built statement block.
    pub fn with_body(mut self, body: Block) -> Self {
        self.body = Some(body);
        self.source = None;
        self
    }

    pub fn translate(&self) -> Result<Translation, TranError> {
        let (body, functions) = match (&self.source, &self.body) {
            (Some(source), _) => {
                let parsed = parse_model(source, &self.descriptor)?;
                let mut env = self.functions.clone();
                env.merge(parsed.functions);
                (parsed.body, env)
            }
            (None, Some(body)) => (body.clone(), self.functions.clone()),
            (None, None) => {
                return Err(
                    ParseError::new("No model source was provided", Span::default()).into(),
                )
            }
        };
        self.lower(body, &functions)
    }

    fn lower(&self, body: Block, functions: &FunctionEnv) -> Result<Translation, TranError> {
        ensure_known_calls(&body, functions)?;
        let body = inline_block(&body, functions, InlineStage::Preprocess)?;
        let body = inline_block(&body, functions, InlineStage::Always)?;
        let opts = DiffOptions { order: self.order };
        let body = differentiate(&body, &self.descriptor, &opts)?;
        let body = inline_block(&body, functions, InlineStage::Postprocess)?;
        ensure_no_calls(&body)?;
        let unit = emit_unit(&body, &self.descriptor, &self.solver)?;
        Ok(Translation {
            normalized: unparse(&body),
            unit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inline::{FunctionDef, Param};
    use crate::model::ModuleBuilder;
    use crate::syntax::{Expr, ResultKind, Stmt, StmtKind};

    fn pred_descriptor() -> ModuleDescriptor {
        ModuleBuilder::pred()
            .theta("tvcl", 1.0)
            .theta("tvv", 10.0)
            .eta("iiv_cl")
            .eps("prop")
            .covariate("wt")
            .build()
            .unwrap()
    }

    #[test]
    fn source_runs_the_whole_pipeline() {
        let src = "fn scale(x, ref = 70) {\n  return x / ref\n}\n\
                   cl = tvcl * exp(iiv_cl) * scale(wt)\n\
                   ipred = cl / tvv\n\
                   return ipred * (1 + prop)\n";
        let t = Translator::new(pred_descriptor())
            .with_source(src)
            .translate()
            .unwrap();

        assert!(t.normalized.contains("__scale__x = wt"));
        assert!(t.normalized.contains("__scale__ref = 70.0"));
        assert!(t.normalized.contains("__X__[cl, iiv_cl]"));
        assert!(t.normalized.contains("__Y__[iiv_cl]"));
        assert!(t.normalized.contains("__Y__[prop]"));
        assert!(!t.normalized.contains("scale("));

        assert!(t.unit.source.contains("let mut __scale__x = 0.0;"));
        assert!(t.unit.source.contains("ctx.y_kind = 0;"));
        assert!(t.unit.source.contains("break 'pred;"));
        assert!(t
            .unit
            .symbols
            .iter()
            .any(|s| s.name == "wt" && s.index.is_none()));
    }

    #[test]
    fn first_order_leaves_no_second_order_rows() {
        let src = "cl = tvcl * exp(iiv_cl)\nreturn cl * (1 + prop)\n";
        let t = Translator::new(pred_descriptor())
            .with_source(src)
            .with_order(SensitivityOrder::First)
            .translate()
            .unwrap();
        assert!(t.normalized.contains("__Y__[iiv_cl]"));
        assert!(!t.normalized.contains("__Y__[iiv_cl, iiv_cl]"));
        assert!(!t.normalized.contains("__Y__[iiv_cl, prop]"));
    }

    #[test]
    fn registered_helpers_expand_like_source_ones() {
        let mut env = FunctionEnv::new();
        env.define(FunctionDef::new(
            "double",
            vec![Param::required("x")],
            vec![Stmt::new(
                StmtKind::Return {
                    value: Expr::local("x") * Expr::num(2.0),
                    kind: ResultKind::Prediction,
                },
                Span::default(),
            )],
            InlineStage::Always,
        ));
        let t = Translator::new(pred_descriptor())
            .with_functions(env)
            .with_source("cl = double(tvcl)\nreturn cl\n")
            .translate()
            .unwrap();
        assert!(t.normalized.contains("__double__x = tvcl"));
        assert!(t.normalized.contains("cl = __double__return"));
    }

    #[test]
    fn undefined_calls_fail_before_any_pass() {
        let err = Translator::new(pred_descriptor())
            .with_source("y = mystery(1.0)\nreturn y\n")
            .translate()
            .unwrap_err();
        assert!(matches!(err, TranError::Inline(_)));
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn use_before_definition_fails_in_validation() {
        let err = Translator::new(pred_descriptor())
            .with_source("k = cl / 2.0\nreturn k\n")
            .translate()
            .unwrap_err();
        assert!(matches!(err, TranError::Diff(_)));
        assert!(err.to_string().contains("cl"));
    }

    #[test]
    fn missing_input_is_reported() {
        let err = Translator::new(pred_descriptor()).translate().unwrap_err();
        assert_eq!(err.to_string(), "No model source was provided");
        assert!(err.span().is_none());
    }

    #[test]
    fn identical_inputs_translate_identically() {
        let src = "cl = tvcl * exp(iiv_cl)\nreturn cl * (1 + prop)\n";
        let a = Translator::new(pred_descriptor())
            .with_source(src)
            .translate()
            .unwrap();
        let b = Translator::new(pred_descriptor())
            .with_source(src)
            .translate()
            .unwrap();
        assert_eq!(a.normalized, b.normalized);
        assert_eq!(a.unit.source, b.unit.source);
    }
}
