//! Native unit emission.
//!
//! Turns a lowered statement block into a self-contained Rust translation
//! unit: a symbol table struct with by-index and by-name setters, a module
//! struct implementing [`PredModule`](crate::runtime::PredModule), and the
//! C-ABI factory pair a host resolves after `dlopen`. Emission is two-phase:
//! the typing walk in [`types`] fixes every local's type and rejects
//! ill-typed blocks before any text is produced, then the rendering walk
//! prints statements in source order. Identical input yields byte-identical
//! text.
//!
//! Every source statement is echoed as a comment above its native form;
//! rows the runtime cannot represent (derivatives of the result or of dose
//! parameters with respect to compartment amounts) keep the echo and emit
//! no code.

pub mod types;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CodegenError;
use crate::model::{ConfigValue, CovKind, ModuleDescriptor, ModuleKind, OdeSolver};
use crate::runtime::{state_first, state_second, y_eps, y_eta, y_mixed, y_second};
use crate::syntax::{
    stmt_headline, AssignTarget, BinOp, Block, DerivOf, DerivRef, Expr, Intrinsic, Leaf, Span,
    Stmt, StmtKind, UnaryOp, Wrt,
};

pub use types::{check_block, infer, TypeTable, ValueType};

// ───────────────────────────── Unit Description ─────────────────────────────

/// Declaration class of a symbol surfaced by the generated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolClass {
    Theta,
    Eta,
    Eps,
    Covariate,
    Shared,
}

/// One entry of the generated symbol table, as seen by a host.
///
/// Indexed classes (`theta`, `eta`, `eps`) carry their slot index; named
/// classes (`covariate`, `shared`) are set by name only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub name: String,
    pub class: SymbolClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// A complete generated translation unit plus the metadata a host needs to
/// stage inputs without parsing the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedUnit {
    pub source: String,
    pub symbols: Vec<SymbolEntry>,
    pub kind: ModuleKind,
    pub advan: u8,
    pub trans: u8,
}

/// Emit the native unit for a lowered block.
///
/// The block must be fully lowered: helper calls inlined away and
/// sensitivity rows already present. Solver settings are baked into the
/// unit as configuration literals.
pub fn emit_unit(
    block: &Block,
    descriptor: &ModuleDescriptor,
    solver: &OdeSolver,
) -> Result<GeneratedUnit, CodegenError> {
    let table = types::check_block(block, descriptor)?;
    let mut emitter = Emitter::new(descriptor, table);
    emitter.collect(block, 0);
    let source = emitter.render_unit(block, solver)?;
    Ok(GeneratedUnit {
        source,
        symbols: symbol_entries(descriptor),
        kind: descriptor.kind,
        advan: descriptor.advan,
        trans: descriptor.trans,
    })
}

fn symbol_entries(descriptor: &ModuleDescriptor) -> Vec<SymbolEntry> {
    let mut out = Vec::new();
    for (i, t) in descriptor.thetas.iter().enumerate() {
        out.push(SymbolEntry {
            name: t.name.clone(),
            class: SymbolClass::Theta,
            index: Some(i),
        });
    }
    for (i, e) in descriptor.etas.iter().enumerate() {
        out.push(SymbolEntry {
            name: e.name.clone(),
            class: SymbolClass::Eta,
            index: Some(i),
        });
    }
    for (i, e) in descriptor.epsilons.iter().enumerate() {
        out.push(SymbolEntry {
            name: e.name.clone(),
            class: SymbolClass::Eps,
            index: Some(i),
        });
    }
    for c in &descriptor.covariates {
        out.push(SymbolEntry {
            name: c.name.clone(),
            class: SymbolClass::Covariate,
            index: None,
        });
    }
    for s in &descriptor.sharedvars {
        out.push(SymbolEntry {
            name: s.name.clone(),
            class: SymbolClass::Shared,
            index: None,
        });
    }
    out
}

// ─────────────────────────────── Emitter ───────────────────────────────

// Rust operator precedence levels used for minimal parenthesization.
// Comparisons are non-associative, so their operands require strictly
// higher precedence.
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_CMP: u8 = 3;
const PREC_ADD: u8 = 4;
const PREC_MUL: u8 = 5;
const PREC_UNARY: u8 = 6;

fn rust_prec(op: BinOp) -> u8 {
    match op {
        BinOp::Or => PREC_OR,
        BinOp::And => PREC_AND,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => PREC_CMP,
        BinOp::Add | BinOp::Sub => PREC_ADD,
        BinOp::Mul | BinOp::Div => PREC_MUL,
        // `^` lowers to a `.powf` call and never reaches the infix printer.
        BinOp::Pow => PREC_UNARY,
    }
}

fn rust_op(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Pow => ".powf",
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

fn paren_if(text: String, prec: u8, min_prec: u8) -> String {
    if prec < min_prec {
        format!("({})", text)
    } else {
        text
    }
}

// Second derivatives are symmetric; every pair slot stores the ordered form.
fn ordered(u: usize, v: usize) -> (usize, usize) {
    if u >= v {
        (u, v)
    } else {
        (v, u)
    }
}

fn unary_method(f: Intrinsic) -> Option<&'static str> {
    Some(match f {
        Intrinsic::Exp => "exp",
        Intrinsic::Log2 => "log2",
        Intrinsic::Log10 => "log10",
        Intrinsic::Sqrt => "sqrt",
        Intrinsic::Abs => "abs",
        Intrinsic::Sin => "sin",
        Intrinsic::Cos => "cos",
        Intrinsic::Tan => "tan",
        Intrinsic::Floor => "floor",
        Intrinsic::Ceil => "ceil",
        _ => return None,
    })
}

fn config_literal(value: &ConfigValue) -> String {
    match value {
        ConfigValue::Float(v) => format!("ConfigValue::Float({:?})", v),
        ConfigValue::Int(v) => format!("ConfigValue::Int({})", v),
        ConfigValue::Str(s) => format!("ConfigValue::Str(\"{}\".to_string())", s),
    }
}

fn walk_exprs(stmts: &[Stmt], f: &mut impl FnMut(&Expr)) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Assign { value, .. } => value.walk(f),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                cond.walk(f);
                walk_exprs(then_body, f);
                walk_exprs(else_body, f);
            }
            StmtKind::Return { value, .. } => value.walk(f),
            StmtKind::Solve => {}
        }
    }
}

/// Descriptor symbols referenced anywhere in the block, by declared name.
fn external_refs(block: &Block) -> HashSet<String> {
    let mut names = HashSet::new();
    walk_exprs(block, &mut |e| {
        if let Expr::Leaf(
            Leaf::Theta(n) | Leaf::Eta(n) | Leaf::Eps(n) | Leaf::Covariate(n) | Leaf::Shared(n),
        ) = e
        {
            names.insert(n.clone());
        }
    });
    names
}

struct Emitter<'a> {
    descriptor: &'a ModuleDescriptor,
    table: TypeTable,
    /// Derivative-slot names, keyed by the full structural ref; the same
    /// ref reuses its name everywhere, including across branches.
    slots: HashMap<DerivRef, String>,
    /// Declarations in first-assignment order.
    decls: Vec<(String, ValueType)>,
    declared: HashSet<String>,
    /// Locals with at least one top-level assignment; these are exported
    /// into `ctx.locals` after the body.
    exported: HashSet<String>,
}

impl<'a> Emitter<'a> {
    fn new(descriptor: &'a ModuleDescriptor, table: TypeTable) -> Self {
        Emitter {
            descriptor,
            table,
            slots: HashMap::new(),
            decls: Vec::new(),
            declared: HashSet::new(),
            exported: HashSet::new(),
        }
    }

    /// Pre-walk: fix declaration order and derivative-slot numbering.
    fn collect(&mut self, stmts: &[Stmt], depth: usize) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Assign { target, .. } => match target {
                    AssignTarget::Local(name) => {
                        if self.declared.insert(name.clone()) {
                            self.decls.push((name.clone(), self.table.local(name)));
                        }
                        if depth == 0 {
                            self.exported.insert(name.clone());
                        }
                    }
                    AssignTarget::Deriv(r) => {
                        self.slot_name(r);
                    }
                    _ => {}
                },
                StmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    self.collect(then_body, depth + 1);
                    self.collect(else_body, depth + 1);
                }
                _ => {}
            }
        }
    }

    fn slot_name(&mut self, r: &DerivRef) -> String {
        if let Some(name) = self.slots.get(r) {
            return name.clone();
        }
        let name = format!("__X_{}", self.slots.len());
        self.slots.insert(r.clone(), name.clone());
        self.declared.insert(name.clone());
        self.decls.push((name.clone(), ValueType::Double));
        name
    }

    fn eta_index(&self, name: &str, span: Span) -> Result<usize, CodegenError> {
        self.descriptor.eta_index(name).ok_or_else(|| {
            CodegenError::type_error(format!("Unknown random effect '{}'", name), span)
        })
    }

    fn eps_index(&self, name: &str, span: Span) -> Result<usize, CodegenError> {
        self.descriptor.eps_index(name).ok_or_else(|| {
            CodegenError::type_error(format!("Unknown error term '{}'", name), span)
        })
    }

    fn infer_type(&self, expr: &Expr, span: Span) -> Result<ValueType, CodegenError> {
        types::infer(expr, self.descriptor, &self.table, span)
    }

    // ───────────────────────── Unit assembly ─────────────────────────

    fn render_unit(&mut self, block: &Block, solver: &OdeSolver) -> Result<String, CodegenError> {
        let mut out = String::new();
        out.push_str("// Generated prediction module. Do not edit.\n\n");
        out.push_str(
            "#![allow(dead_code, non_snake_case, unreachable_code, unused_assignments, \
             unused_imports, unused_labels, unused_parens, unused_variables)]\n\n",
        );
        out.push_str("use std::ffi::c_void;\n\n");
        out.push_str("use pharmtran::model::{ConfigValue, ModuleKind};\n");
        out.push_str(
            "use pharmtran::runtime::{\n    plog, PredContext, PredError, PredModule, \
             SymbolTable, MODULE_ABI_VERSION,\n};\n\n",
        );
        self.render_symbol_table(&mut out);
        self.render_module(&mut out, block, solver)?;
        out.push_str(
            "#[no_mangle]\npub extern \"C\" fn __module_abi_version() -> u32 {\n    \
             MODULE_ABI_VERSION\n}\n\n",
        );
        out.push_str(
            "#[no_mangle]\npub extern \"C\" fn __module_factory() -> *mut c_void {\n    \
             let module: Box<dyn PredModule> = Box::new(__Module::default());\n    \
             Box::into_raw(Box::new(module)) as *mut c_void\n}\n",
        );
        Ok(out)
    }

    fn render_symbol_table(&self, out: &mut String) {
        let d = self.descriptor;
        let names: Vec<String> = symbol_entries(d)
            .iter()
            .map(|s| format!("\"{}\"", s.name))
            .collect();
        out.push_str(&format!(
            "const __SYMBOL_NAMES: &[&str] = &[{}];\n\n",
            names.join(", ")
        ));

        out.push_str("#[derive(Default)]\npub struct __SymbolTable {\n");
        for t in &d.thetas {
            out.push_str(&format!("    __self_{}: f64,\n", t.name));
        }
        for e in &d.etas {
            out.push_str(&format!("    __self_{}: f64,\n", e.name));
        }
        for e in &d.epsilons {
            out.push_str(&format!("    __self_{}: f64,\n", e.name));
        }
        for c in &d.covariates {
            match c.kind {
                CovKind::Text => out.push_str(&format!("    __self_{}: String,\n", c.name)),
                CovKind::Numeric => out.push_str(&format!("    __self_{}: f64,\n", c.name)),
            }
        }
        for s in &d.sharedvars {
            out.push_str(&format!("    __self_{}: f64,\n", s.name));
        }
        out.push_str("}\n\n");

        out.push_str("impl SymbolTable for __SymbolTable {\n");
        render_index_setter(out, "set_theta", d.thetas.iter().map(|t| t.name.as_str()));
        render_index_setter(out, "set_eta", d.etas.iter().map(|e| e.name.as_str()));
        render_index_setter(out, "set_eps", d.epsilons.iter().map(|e| e.name.as_str()));

        out.push_str("    fn set_covariate(&mut self, name: &str, value: f64) -> bool {\n");
        out.push_str("        match name {\n");
        for c in &d.covariates {
            if c.kind == CovKind::Numeric {
                out.push_str(&format!(
                    "            \"{}\" => self.__self_{} = value,\n",
                    c.name, c.name
                ));
            }
        }
        out.push_str("            _ => return false,\n        }\n        true\n    }\n\n");

        out.push_str(
            "    fn set_covariate_text(&mut self, name: &str, value: &str) -> bool {\n",
        );
        out.push_str("        match name {\n");
        for c in &d.covariates {
            if c.kind == CovKind::Text {
                out.push_str(&format!(
                    "            \"{}\" => self.__self_{} = value.to_string(),\n",
                    c.name, c.name
                ));
            }
        }
        out.push_str("            _ => return false,\n        }\n        true\n    }\n\n");

        out.push_str("    fn set_shared(&mut self, name: &str, value: f64) -> bool {\n");
        out.push_str("        match name {\n");
        for s in &d.sharedvars {
            out.push_str(&format!(
                "            \"{}\" => self.__self_{} = value,\n",
                s.name, s.name
            ));
        }
        out.push_str("            _ => return false,\n        }\n        true\n    }\n\n");

        out.push_str(
            "    fn names(&self) -> &'static [&'static str] {\n        __SYMBOL_NAMES\n    }\n",
        );
        out.push_str("}\n\n");
    }

    fn render_module(
        &mut self,
        out: &mut String,
        block: &Block,
        solver: &OdeSolver,
    ) -> Result<(), CodegenError> {
        let d = self.descriptor;
        out.push_str("#[derive(Default)]\npub struct __Module {\n    table: __SymbolTable,\n}\n\n");
        out.push_str("impl PredModule for __Module {\n");

        let kind = match d.kind {
            ModuleKind::Ode => "ModuleKind::Ode",
            ModuleKind::ClosedForm => "ModuleKind::ClosedForm",
            ModuleKind::Pred => "ModuleKind::Pred",
        };
        out.push_str(&format!(
            "    fn kind(&self) -> ModuleKind {{\n        {}\n    }}\n\n",
            kind
        ));
        out.push_str(&format!(
            "    fn advan(&self) -> u8 {{\n        {}\n    }}\n\n",
            d.advan
        ));
        out.push_str(&format!(
            "    fn trans(&self) -> u8 {{\n        {}\n    }}\n\n",
            d.trans
        ));
        out.push_str(&format!(
            "    fn n_cmt(&self) -> usize {{\n        {}\n    }}\n\n",
            d.n_cmt
        ));
        out.push_str(&format!(
            "    fn n_eta(&self) -> usize {{\n        {}\n    }}\n\n",
            d.n_eta()
        ));
        out.push_str(&format!(
            "    fn n_eps(&self) -> usize {{\n        {}\n    }}\n\n",
            d.n_eps()
        ));
        out.push_str(
            "    fn symbol_table(&self) -> &dyn SymbolTable {\n        &self.table\n    }\n\n",
        );
        out.push_str(
            "    fn symbol_table_mut(&mut self) -> &mut dyn SymbolTable {\n        \
             &mut self.table\n    }\n\n",
        );

        out.push_str("    fn solver_configuration(&self) -> Vec<(String, ConfigValue)> {\n");
        out.push_str("        vec![\n");
        for (key, value) in solver.as_configuration() {
            out.push_str(&format!(
                "            (\"{}\".to_string(), {}),\n",
                key,
                config_literal(&value)
            ));
        }
        out.push_str("        ]\n    }\n\n");

        let shared: Vec<String> = d
            .sharedvars
            .iter()
            .map(|s| format!("\"{}\".to_string()", s.name))
            .collect();
        out.push_str(&format!(
            "    fn shared_names(&self) -> Vec<String> {{\n        vec![{}]\n    }}\n\n",
            shared.join(", ")
        ));

        out.push_str("    fn __pred(&self, ctx: &mut PredContext) -> Result<(), PredError> {\n");
        out.push_str("        // #region Declarations\n");
        self.render_declarations(out, block);
        out.push_str("        // #endregion\n");
        out.push_str("        // #region Body\n");
        out.push_str("        'pred: {\n");
        for stmt in block {
            self.render_stmt(stmt, 3, out)?;
        }
        out.push_str("        }\n");
        out.push_str("        // #endregion\n");
        out.push_str("        // #region Return\n");
        self.render_exports(out);
        out.push_str("        Ok(())\n");
        out.push_str("        // #endregion\n");
        out.push_str("    }\n}\n\n");
        Ok(())
    }

    fn render_declarations(&self, out: &mut String, block: &Block) {
        let d = self.descriptor;
        let refs = external_refs(block);
        for t in &d.thetas {
            if refs.contains(&t.name) {
                out.push_str(&format!(
                    "        let __self_{} = self.table.__self_{};\n",
                    t.name, t.name
                ));
            }
        }
        for e in &d.etas {
            if refs.contains(&e.name) {
                out.push_str(&format!(
                    "        let __self_{} = self.table.__self_{};\n",
                    e.name, e.name
                ));
            }
        }
        for e in &d.epsilons {
            if refs.contains(&e.name) {
                out.push_str(&format!(
                    "        let __self_{} = self.table.__self_{};\n",
                    e.name, e.name
                ));
            }
        }
        for c in &d.covariates {
            if refs.contains(&c.name) {
                match c.kind {
                    CovKind::Text => out.push_str(&format!(
                        "        let __self_{} = self.table.__self_{}.clone();\n",
                        c.name, c.name
                    )),
                    CovKind::Numeric => out.push_str(&format!(
                        "        let __self_{} = self.table.__self_{};\n",
                        c.name, c.name
                    )),
                }
            }
        }
        // Shared vars are always pulled; the export region reads them.
        for s in &d.sharedvars {
            out.push_str(&format!(
                "        let __self_{} = self.table.__self_{};\n",
                s.name, s.name
            ));
        }
        for (name, ty) in &self.decls {
            out.push_str(&format!(
                "        let mut {} = {};\n",
                name,
                ty.default_literal()
            ));
        }
    }

    fn render_exports(&self, out: &mut String) {
        for (name, ty) in &self.decls {
            if *ty == ValueType::Double
                && !name.starts_with("__")
                && self.exported.contains(name)
            {
                out.push_str(&format!(
                    "        ctx.locals.insert(\"{}\".to_string(), {});\n",
                    name, name
                ));
            }
        }
        for s in &self.descriptor.sharedvars {
            out.push_str(&format!(
                "        ctx.locals.insert(\"{}\".to_string(), __self_{});\n",
                s.name, s.name
            ));
        }
    }

    // ───────────────────────── Statements ─────────────────────────

    fn render_stmt(
        &mut self,
        stmt: &Stmt,
        depth: usize,
        out: &mut String,
    ) -> Result<(), CodegenError> {
        let pad = "    ".repeat(depth);
        out.push_str(&format!("{}// {}\n", pad, stmt_headline(stmt)));
        match &stmt.kind {
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let c = self.bool_operand(cond, 0, stmt.span)?;
                out.push_str(&format!("{}if {} {{\n", pad, c));
                for s in then_body {
                    self.render_stmt(s, depth + 1, out)?;
                }
                if !else_body.is_empty() {
                    out.push_str(&format!("{}}} else {{\n", pad));
                    for s in else_body {
                        self.render_stmt(s, depth + 1, out)?;
                    }
                }
                out.push_str(&format!("{}}}\n", pad));
            }
            StmtKind::Assign { target, value } => {
                if let Some(code) = self.assign_code(target, value, stmt.span)? {
                    out.push_str(&format!("{}{}\n", pad, code));
                }
            }
            StmtKind::Return { value, kind } => {
                let v = self.numeric_operand(value, 0, stmt.span)?;
                out.push_str(&format!("{}ctx.y_kind = {};\n", pad, kind.flag()));
                out.push_str(&format!("{}ctx.y[0] = {};\n", pad, v));
                out.push_str(&format!("{}break 'pred;\n", pad));
            }
            StmtKind::Solve => {
                out.push_str(&format!("{}ctx.solve()?;\n", pad));
            }
        }
        Ok(())
    }

    /// Native statement for an assignment, or `None` for rows that are kept
    /// as source-echo comments only.
    fn assign_code(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
        span: Span,
    ) -> Result<Option<String>, CodegenError> {
        let n_cmt = self.descriptor.n_cmt;
        let n_eta = self.descriptor.n_eta();
        let n_eps = self.descriptor.n_eps();
        let code = match target {
            AssignTarget::Local(name) => {
                let ty = self.table.local(name);
                let name = name.clone();
                format!("{} = {};", name, self.typed_value(value, ty, span)?)
            }
            AssignTarget::Deriv(r) => {
                let slot = self.slot_name(r);
                format!("{} = {};", slot, self.numeric_operand(value, 0, span)?)
            }
            AssignTarget::Dadt(cmt) => {
                format!(
                    "ctx.dadt[{}] = {};",
                    cmt,
                    self.numeric_operand(value, 0, span)?
                )
            }
            AssignTarget::DadtWrt { cmt, wrt, wrt2 } => match (wrt, wrt2) {
                (Wrt::Eta(u), None) => {
                    let k = self.eta_index(u, span)?;
                    format!(
                        "ctx.dadt[{}] = {};",
                        state_first(n_cmt, *cmt, k),
                        self.numeric_operand(value, 0, span)?
                    )
                }
                (Wrt::Eta(u), Some(Wrt::Eta(v))) => {
                    let (ku, kv) = ordered(self.eta_index(u, span)?, self.eta_index(v, span)?);
                    format!(
                        "ctx.dadt[{}] = {};",
                        state_second(n_cmt, n_eta, *cmt, ku, kv),
                        self.numeric_operand(value, 0, span)?
                    )
                }
                (Wrt::Amt(j), None) => {
                    format!(
                        "ctx.dadt_jac[{}] = {};",
                        *cmt * n_cmt + *j,
                        self.numeric_operand(value, 0, span)?
                    )
                }
                _ => return Ok(None),
            },
            AssignTarget::DoseParam { cmt, param } => {
                format!(
                    "ctx.set_dose_param({}, \"{}\", {});",
                    cmt,
                    param.name(),
                    self.numeric_operand(value, 0, span)?
                )
            }
            AssignTarget::DoseParamWrt {
                cmt,
                param,
                wrt,
                wrt2,
            } => match (wrt, wrt2) {
                (Wrt::Eta(u), None) => {
                    let k = self.eta_index(u, span)?;
                    format!(
                        "ctx.set_dose_param_wrt({}, \"{}\", {}, {});",
                        cmt,
                        param.name(),
                        k,
                        self.numeric_operand(value, 0, span)?
                    )
                }
                (Wrt::Eta(u), Some(Wrt::Eta(v))) => {
                    let (ku, kv) = ordered(self.eta_index(u, span)?, self.eta_index(v, span)?);
                    format!(
                        "ctx.set_dose_param_wrt2({}, \"{}\", {}, {}, {});",
                        cmt,
                        param.name(),
                        ku,
                        kv,
                        self.numeric_operand(value, 0, span)?
                    )
                }
                _ => return Ok(None),
            },
            AssignTarget::SolveArg(key) => {
                format!(
                    "ctx.set_solve_arg(\"{}\", {});",
                    key.ident(),
                    self.numeric_operand(value, 0, span)?
                )
            }
            AssignTarget::SolveArgWrt { key, wrt, wrt2 } => match (wrt, wrt2) {
                (Wrt::Eta(u), None) => {
                    let k = self.eta_index(u, span)?;
                    format!(
                        "ctx.set_solve_arg_wrt(\"{}\", {}, {});",
                        key.ident(),
                        k,
                        self.numeric_operand(value, 0, span)?
                    )
                }
                (Wrt::Eta(u), Some(Wrt::Eta(v))) => {
                    let (ku, kv) = ordered(self.eta_index(u, span)?, self.eta_index(v, span)?);
                    format!(
                        "ctx.set_solve_arg_wrt2(\"{}\", {}, {}, {});",
                        key.ident(),
                        ku,
                        kv,
                        self.numeric_operand(value, 0, span)?
                    )
                }
                _ => return Ok(None),
            },
            AssignTarget::YWrt { wrt, wrt2 } => {
                let idx = match (wrt, wrt2) {
                    (Wrt::Eta(u), None) => y_eta(self.eta_index(u, span)?),
                    (Wrt::Eps(e), None) => y_eps(n_eta, self.eps_index(e, span)?),
                    (Wrt::Eta(u), Some(Wrt::Eps(e))) => {
                        y_mixed(n_eta, n_eps, self.eta_index(u, span)?, self.eps_index(e, span)?)
                    }
                    (Wrt::Eta(u), Some(Wrt::Eta(v))) => {
                        let (ku, kv) =
                            ordered(self.eta_index(u, span)?, self.eta_index(v, span)?);
                        y_second(n_eta, n_eps, ku, kv)
                    }
                    _ => return Ok(None),
                };
                format!("ctx.y[{}] = {};", idx, self.numeric_operand(value, 0, span)?)
            }
        };
        Ok(Some(code))
    }

    // ───────────────────────── Expressions ─────────────────────────

    fn typed_value(
        &mut self,
        value: &Expr,
        ty: ValueType,
        span: Span,
    ) -> Result<String, CodegenError> {
        match ty {
            ValueType::Str => self.str_value(value, span),
            ValueType::Bool => self.bool_operand(value, 0, span),
            _ => self.numeric_operand(value, 0, span),
        }
    }

    /// Render for an `f64` context, casting bool-typed values through `i64`.
    fn numeric_operand(
        &mut self,
        expr: &Expr,
        min_prec: u8,
        span: Span,
    ) -> Result<String, CodegenError> {
        if self.infer_type(expr, span)? == ValueType::Bool {
            let body = self.render(expr, 0, span)?;
            Ok(format!("(({}) as i64 as f64)", body))
        } else {
            self.render(expr, min_prec, span)
        }
    }

    /// Render for a `bool` context, testing numeric values against zero.
    fn bool_operand(
        &mut self,
        expr: &Expr,
        min_prec: u8,
        span: Span,
    ) -> Result<String, CodegenError> {
        if self.infer_type(expr, span)? == ValueType::Bool {
            self.render(expr, min_prec, span)
        } else {
            let body = self.render(expr, 0, span)?;
            Ok(format!("(({}) != 0.0)", body))
        }
    }

    /// Render as a method-call receiver; anything that is not a plain leaf
    /// path is parenthesized so the call binds to the whole expression.
    fn numeric_receiver(&mut self, expr: &Expr, span: Span) -> Result<String, CodegenError> {
        if self.infer_type(expr, span)? == ValueType::Bool {
            let body = self.render(expr, 0, span)?;
            return Ok(format!("(({}) as i64 as f64)", body));
        }
        match expr {
            Expr::Leaf(leaf) => Ok(self.leaf_read(leaf)),
            _ => Ok(format!("({})", self.render(expr, 0, span)?)),
        }
    }

    fn render(&mut self, expr: &Expr, min_prec: u8, span: Span) -> Result<String, CodegenError> {
        match expr {
            Expr::Num(n) => Ok(format!("{:?}", n.0)),
            Expr::Leaf(l) => Ok(self.leaf_read(l)),
            Expr::Deriv(r) => self.deriv_read(r, span),
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => {
                let body = self.numeric_operand(operand, PREC_UNARY, span)?;
                Ok(paren_if(format!("-{}", body), PREC_UNARY, min_prec))
            }
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => {
                let body = self.bool_operand(operand, PREC_UNARY, span)?;
                Ok(paren_if(format!("!{}", body), PREC_UNARY, min_prec))
            }
            Expr::Binary {
                op: BinOp::Pow,
                lhs,
                rhs,
            } => {
                let base = self.numeric_receiver(lhs, span)?;
                let exp = self.numeric_operand(rhs, 0, span)?;
                Ok(format!("{}.powf({})", base, exp))
            }
            Expr::Binary { op, lhs, rhs } if matches!(op, BinOp::Eq | BinOp::Ne) => {
                let lt = self.infer_type(lhs, span)?;
                let rt = self.infer_type(rhs, span)?;
                let (l, r) = if lt == ValueType::Str && rt == ValueType::Str {
                    (self.str_place(lhs, span)?, self.str_place(rhs, span)?)
                } else if lt == ValueType::Bool && rt == ValueType::Bool {
                    (
                        self.render(lhs, PREC_CMP + 1, span)?,
                        self.render(rhs, PREC_CMP + 1, span)?,
                    )
                } else {
                    (
                        self.numeric_operand(lhs, PREC_CMP + 1, span)?,
                        self.numeric_operand(rhs, PREC_CMP + 1, span)?,
                    )
                };
                Ok(paren_if(
                    format!("{} {} {}", l, rust_op(*op), r),
                    PREC_CMP,
                    min_prec,
                ))
            }
            Expr::Binary { op, lhs, rhs } if op.is_boolean() => {
                let prec = rust_prec(*op);
                let (l, r) = if matches!(op, BinOp::And | BinOp::Or) {
                    (
                        self.bool_operand(lhs, prec, span)?,
                        self.bool_operand(rhs, prec + 1, span)?,
                    )
                } else {
                    // Comparisons are non-associative in Rust; both operands
                    // need strictly tighter binding.
                    (
                        self.numeric_operand(lhs, prec + 1, span)?,
                        self.numeric_operand(rhs, prec + 1, span)?,
                    )
                };
                Ok(paren_if(
                    format!("{} {} {}", l, rust_op(*op), r),
                    prec,
                    min_prec,
                ))
            }
            Expr::Binary { op, lhs, rhs } => {
                let prec = rust_prec(*op);
                let l = self.numeric_operand(lhs, prec, span)?;
                let r = self.numeric_operand(rhs, prec + 1, span)?;
                Ok(paren_if(
                    format!("{} {} {}", l, rust_op(*op), r),
                    prec,
                    min_prec,
                ))
            }
            Expr::Func { f, args } => self.func_text(*f, args, span),
            Expr::Call { name, .. } => Err(CodegenError::type_error(
                format!("Unresolved helper call '{}'", name),
                span,
            )),
            Expr::Ternary {
                cond,
                then,
                orelse,
            } => {
                let c = self.bool_operand(cond, 0, span)?;
                let ty = self.infer_type(expr, span)?;
                let (t, e) = match ty {
                    ValueType::Str => (self.str_value(then, span)?, self.str_value(orelse, span)?),
                    ValueType::Bool => {
                        (self.render(then, 0, span)?, self.render(orelse, 0, span)?)
                    }
                    _ => (
                        self.numeric_operand(then, 0, span)?,
                        self.numeric_operand(orelse, 0, span)?,
                    ),
                };
                Ok(format!("(if {} {{ {} }} else {{ {} }})", c, t, e))
            }
        }
    }

    fn func_text(
        &mut self,
        f: Intrinsic,
        args: &[Expr],
        span: Span,
    ) -> Result<String, CodegenError> {
        if let Some(method) = unary_method(f) {
            if let [a] = args {
                return Ok(format!("{}.{}()", self.numeric_receiver(a, span)?, method));
            }
        }
        match (f, args) {
            (Intrinsic::Log, [a]) => Ok(format!("plog({})", self.numeric_operand(a, 0, span)?)),
            (Intrinsic::Pow, [base, exp]) => Ok(format!(
                "{}.powf({})",
                self.numeric_receiver(base, span)?,
                self.numeric_operand(exp, 0, span)?
            )),
            (Intrinsic::Min, [a, b]) => Ok(format!(
                "{}.min({})",
                self.numeric_receiver(a, span)?,
                self.numeric_operand(b, 0, span)?
            )),
            (Intrinsic::Max, [a, b]) => Ok(format!(
                "{}.max({})",
                self.numeric_receiver(a, span)?,
                self.numeric_operand(b, 0, span)?
            )),
            _ => Err(CodegenError::type_error(
                format!("Function '{}' expects {} arguments", f.name(), f.arity()),
                span,
            )),
        }
    }

    fn leaf_read(&self, leaf: &Leaf) -> String {
        match leaf {
            Leaf::Local(n) => n.clone(),
            Leaf::Theta(n)
            | Leaf::Eta(n)
            | Leaf::Eps(n)
            | Leaf::Covariate(n)
            | Leaf::Shared(n) => format!("__self_{}", n),
            Leaf::Amt(i) => format!("ctx.a[{}]", i),
            Leaf::SolvedF => "ctx.solution.f".to_string(),
            Leaf::SolvedA(i) => format!("ctx.solution.a[{}]", i),
            Leaf::Time => "ctx.t".to_string(),
            Leaf::FirstOrder => "ctx.first_order".to_string(),
            Leaf::SecondOrder => "ctx.second_order".to_string(),
        }
    }

    /// Derivative reads: named slots for locals, flat state indices for
    /// amounts, solution hooks for the closed form. A ref that was never
    /// assigned reads as literal `0.0`.
    fn deriv_read(&self, r: &DerivRef, span: Span) -> Result<String, CodegenError> {
        match &r.of {
            DerivOf::Local(_) => Ok(self
                .slots
                .get(r)
                .cloned()
                .unwrap_or_else(|| "0.0".to_string())),
            DerivOf::Amt(i) => match (&r.wrt, &r.wrt2) {
                (Wrt::Eta(u), None) => {
                    let k = self.eta_index(u, span)?;
                    Ok(format!(
                        "ctx.a[{}]",
                        state_first(self.descriptor.n_cmt, *i, k)
                    ))
                }
                (Wrt::Eta(u), Some(Wrt::Eta(v))) => {
                    let (ku, kv) = ordered(self.eta_index(u, span)?, self.eta_index(v, span)?);
                    Ok(format!(
                        "ctx.a[{}]",
                        state_second(self.descriptor.n_cmt, self.descriptor.n_eta(), *i, ku, kv)
                    ))
                }
                // Amounts carry no ε sensitivity.
                _ => Ok("0.0".to_string()),
            },
            DerivOf::SolvedF => match (&r.wrt, &r.wrt2) {
                (Wrt::Eta(u), None) => {
                    Ok(format!("ctx.solution.f_wrt({})", self.eta_index(u, span)?))
                }
                (Wrt::Eta(u), Some(Wrt::Eta(v))) => {
                    let (ku, kv) = ordered(self.eta_index(u, span)?, self.eta_index(v, span)?);
                    Ok(format!("ctx.solution.f_wrt2({}, {})", ku, kv))
                }
                _ => Ok("0.0".to_string()),
            },
        }
    }

    fn str_place(&mut self, expr: &Expr, span: Span) -> Result<String, CodegenError> {
        match expr {
            Expr::Leaf(Leaf::Covariate(n)) => Ok(format!("__self_{}", n)),
            Expr::Leaf(Leaf::Local(n)) => Ok(n.clone()),
            Expr::Ternary { .. } => self.str_value(expr, span),
            _ => self.render(expr, 0, span),
        }
    }

    fn str_value(&mut self, expr: &Expr, span: Span) -> Result<String, CodegenError> {
        match expr {
            Expr::Leaf(Leaf::Covariate(n)) => Ok(format!("__self_{}.clone()", n)),
            Expr::Leaf(Leaf::Local(n)) => Ok(format!("{}.clone()", n)),
            Expr::Ternary {
                cond,
                then,
                orelse,
            } => {
                let c = self.bool_operand(cond, 0, span)?;
                let t = self.str_value(then, span)?;
                let e = self.str_value(orelse, span)?;
                Ok(format!("(if {} {{ {} }} else {{ {} }})", c, t, e))
            }
            _ => self.render(expr, 0, span),
        }
    }
}

fn render_index_setter<'n>(
    out: &mut String,
    method: &str,
    names: impl Iterator<Item = &'n str>,
) {
    out.push_str(&format!(
        "    fn {}(&mut self, index: usize, value: f64) {{\n        match index {{\n",
        method
    ));
    for (i, name) in names.enumerate() {
        out.push_str(&format!("            {} => self.__self_{} = value,\n", i, name));
    }
    out.push_str("            _ => {}\n        }\n    }\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleBuilder, SolutionKind};
    use crate::syntax::{ParamKey, ResultKind};

    fn span() -> Span {
        Span::default()
    }

    fn pred_descriptor() -> ModuleDescriptor {
        ModuleBuilder::pred()
            .theta("pop_cl", 5.0)
            .eta("iiv_cl")
            .eps("add_a")
            .covariate("wt")
            .shared("crcl_u")
            .build()
            .unwrap()
    }

    fn local(name: &str, value: Expr) -> Stmt {
        Stmt::assign(AssignTarget::Local(name.into()), value, Span::default())
    }

    fn emit(block: &Block, descriptor: &ModuleDescriptor) -> GeneratedUnit {
        emit_unit(block, descriptor, &OdeSolver::default()).unwrap()
    }

    #[test]
    fn pred_unit_has_table_body_and_factory() {
        let d = pred_descriptor();
        let block = vec![
            local("cl", Expr::theta("pop_cl") * Expr::covariate("wt")),
            Stmt::assign(
                AssignTarget::Deriv(DerivRef::first(
                    DerivOf::Local("cl".into()),
                    Wrt::Eta("iiv_cl".into()),
                )),
                Expr::covariate("wt"),
                span(),
            ),
            Stmt::new(
                StmtKind::If {
                    cond: Expr::Leaf(Leaf::FirstOrder),
                    then_body: vec![Stmt::assign(
                        AssignTarget::YWrt {
                            wrt: Wrt::Eta("iiv_cl".into()),
                            wrt2: None,
                        },
                        Expr::deriv(DerivRef::first(
                            DerivOf::Local("cl".into()),
                            Wrt::Eta("iiv_cl".into()),
                        )),
                        span(),
                    )],
                    else_body: vec![],
                },
                span(),
            ),
            Stmt::new(
                StmtKind::Return {
                    value: Expr::local("cl") + Expr::eps("add_a"),
                    kind: ResultKind::Prediction,
                },
                span(),
            ),
        ];
        let unit = emit(&block, &d);
        let src = &unit.source;

        assert!(src.contains("pub struct __SymbolTable {"));
        assert!(src.contains("__self_pop_cl: f64,"));
        assert!(src.contains("0 => self.__self_pop_cl = value,"));
        assert!(src.contains("\"wt\" => self.__self_wt = value,"));
        assert!(src.contains(
            "const __SYMBOL_NAMES: &[&str] = &[\"pop_cl\", \"iiv_cl\", \"add_a\", \"wt\", \"crcl_u\"];"
        ));

        assert!(src.contains("let __self_pop_cl = self.table.__self_pop_cl;"));
        assert!(src.contains("let __self_crcl_u = self.table.__self_crcl_u;"));
        assert!(src.contains("let mut cl = 0.0;"));
        assert!(src.contains("let mut __X_0 = 0.0;"));

        assert!(src.contains("// cl = pop_cl * wt"));
        assert!(src.contains("cl = __self_pop_cl * __self_wt;"));
        assert!(src.contains("__X_0 = __self_wt;"));
        assert!(src.contains("if ctx.first_order {"));
        assert!(src.contains("ctx.y[1] = __X_0;"));
        assert!(src.contains("ctx.y_kind = 0;"));
        assert!(src.contains("ctx.y[0] = cl + __self_add_a;"));
        assert!(src.contains("break 'pred;"));

        assert!(src.contains("ctx.locals.insert(\"cl\".to_string(), cl);"));
        assert!(src.contains("ctx.locals.insert(\"crcl_u\".to_string(), __self_crcl_u);"));
        assert!(src.contains("fn __module_factory() -> *mut c_void"));
        assert!(src.contains("fn __module_abi_version() -> u32"));
        assert!(src.contains("fn shared_names(&self) -> Vec<String> {\n        vec![\"crcl_u\".to_string()]"));

        assert_eq!(unit.kind, ModuleKind::Pred);
        assert_eq!(unit.symbols.len(), 5);
        assert_eq!(unit.symbols[0].name, "pop_cl");
        assert_eq!(unit.symbols[0].class, SymbolClass::Theta);
        assert_eq!(unit.symbols[0].index, Some(0));
        assert_eq!(unit.symbols[3].class, SymbolClass::Covariate);
        assert_eq!(unit.symbols[3].index, None);
    }

    #[test]
    fn ode_rows_use_flat_state_indices() {
        let d = ModuleBuilder::ode(2)
            .theta("pop_cl", 1.0)
            .eta("iiv_cl")
            .build()
            .unwrap();
        let block = vec![
            Stmt::assign(AssignTarget::Dadt(0), -Expr::amt(0), span()),
            Stmt::assign(
                AssignTarget::DadtWrt {
                    cmt: 1,
                    wrt: Wrt::Eta("iiv_cl".into()),
                    wrt2: None,
                },
                Expr::deriv(DerivRef::first(DerivOf::Amt(1), Wrt::Eta("iiv_cl".into()))),
                span(),
            ),
            Stmt::assign(
                AssignTarget::DadtWrt {
                    cmt: 0,
                    wrt: Wrt::Amt(1),
                    wrt2: None,
                },
                Expr::num(1.0),
                span(),
            ),
            Stmt::assign(
                AssignTarget::DadtWrt {
                    cmt: 0,
                    wrt: Wrt::Eta("iiv_cl".into()),
                    wrt2: Some(Wrt::Eta("iiv_cl".into())),
                },
                Expr::deriv(DerivRef::second(
                    DerivOf::Amt(0),
                    Wrt::Eta("iiv_cl".into()),
                    Wrt::Eta("iiv_cl".into()),
                )),
                span(),
            ),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("ctx.dadt[0] = -ctx.a[0];"));
        // First-order row of cmt 1 wrt eta 0 sits at 2 + 0*2 + 1 = 3.
        assert!(src.contains("ctx.dadt[3] = ctx.a[3];"));
        assert!(src.contains("ctx.dadt_jac[1] = 1.0;"));
        // Second-order row of cmt 0: 2 + 2*1 + 0*2 + 0 = 4.
        assert!(src.contains("ctx.dadt[4] = ctx.a[4];"));
    }

    #[test]
    fn y_slots_follow_the_result_layout() {
        let d = ModuleBuilder::pred()
            .eta("iiv_cl")
            .eta("iiv_v")
            .eps("add_a")
            .build()
            .unwrap();
        let block = vec![
            Stmt::assign(
                AssignTarget::YWrt {
                    wrt: Wrt::Eps("add_a".into()),
                    wrt2: None,
                },
                Expr::num(1.0),
                span(),
            ),
            Stmt::assign(
                AssignTarget::YWrt {
                    wrt: Wrt::Eta("iiv_cl".into()),
                    wrt2: Some(Wrt::Eps("add_a".into())),
                },
                Expr::num(2.0),
                span(),
            ),
            Stmt::assign(
                AssignTarget::YWrt {
                    wrt: Wrt::Eta("iiv_v".into()),
                    wrt2: Some(Wrt::Eta("iiv_cl".into())),
                },
                Expr::num(3.0),
                span(),
            ),
        ];
        let src = emit(&block, &d).source;
        // n_eta=2, n_eps=1: eps at 1+2+0=3, mixed(0,0) at 4, second(1,0) at 7.
        assert!(src.contains("ctx.y[3] = 1.0;"));
        assert!(src.contains("ctx.y[4] = 2.0;"));
        assert!(src.contains("ctx.y[7] = 3.0;"));
    }

    #[test]
    fn amount_rows_without_native_slots_stay_comments() {
        let d = pred_descriptor();
        let block = vec![
            Stmt::assign(
                AssignTarget::YWrt {
                    wrt: Wrt::Amt(0),
                    wrt2: None,
                },
                Expr::num(1.0),
                span(),
            ),
            Stmt::assign(
                AssignTarget::DoseParamWrt {
                    cmt: 0,
                    param: crate::syntax::DoseParam::Fraction,
                    wrt: Wrt::Amt(0),
                    wrt2: None,
                },
                Expr::num(1.0),
                span(),
            ),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("// __Y__[a(1)] = 1.0"));
        assert!(src.contains("// __DOSE__[cmt(1).f, a(1)] = 1.0"));
        assert!(!src.contains("ctx.y["));
        assert!(!src.contains("set_dose_param_wrt"));
    }

    #[test]
    fn log_routes_through_plog_and_pow_lowers_to_powf() {
        let d = pred_descriptor();
        let block = vec![
            local("k", Expr::covariate("wt").log()),
            local("v", Expr::local("k").pow(Expr::num(2.0))),
            local("z", Expr::num(2.0).pow(Expr::covariate("wt"))),
            local(
                "m",
                Expr::Func {
                    f: Intrinsic::Min,
                    args: vec![Expr::local("k"), Expr::local("v")],
                },
            ),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("k = plog(__self_wt);"));
        assert!(src.contains("v = k.powf(2.0);"));
        assert!(src.contains("z = (2.0).powf(__self_wt);"));
        assert!(src.contains("m = k.min(v);"));
    }

    #[test]
    fn numeric_conditions_test_against_zero() {
        let d = pred_descriptor();
        let block = vec![
            local("cl", Expr::theta("pop_cl")),
            Stmt::new(
                StmtKind::If {
                    cond: Expr::local("cl"),
                    then_body: vec![local("k", Expr::num(1.0))],
                    else_body: vec![],
                },
                span(),
            ),
            Stmt::new(
                StmtKind::If {
                    cond: Expr::binary(BinOp::Gt, Expr::covariate("wt"), Expr::num(70.0)),
                    then_body: vec![local("k", Expr::num(2.0))],
                    else_body: vec![],
                },
                span(),
            ),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("if ((cl) != 0.0) {"));
        assert!(src.contains("if __self_wt > 70.0 {"));
    }

    #[test]
    fn bool_values_cast_into_numeric_contexts() {
        let d = pred_descriptor();
        let block = vec![
            local("flag", Expr::Leaf(Leaf::FirstOrder)),
            local("k", Expr::local("flag") + Expr::num(1.0)),
            Stmt::new(
                StmtKind::Return {
                    value: Expr::binary(BinOp::Gt, Expr::covariate("wt"), Expr::num(70.0)),
                    kind: ResultKind::Likelihood,
                },
                span(),
            ),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("let mut flag = false;"));
        assert!(src.contains("flag = ctx.first_order;"));
        assert!(src.contains("k = ((flag) as i64 as f64) + 1.0;"));
        assert!(src.contains("ctx.y_kind = 1;"));
        assert!(src.contains("ctx.y[0] = ((__self_wt > 70.0) as i64 as f64);"));
    }

    #[test]
    fn text_columns_become_string_fields() {
        let d = ModuleBuilder::pred()
            .covariate_text("SEX")
            .covariate_text("FED")
            .build()
            .unwrap();
        let block = vec![
            local("label", Expr::covariate("SEX")),
            local(
                "same",
                Expr::binary(BinOp::Eq, Expr::covariate("SEX"), Expr::covariate("FED")),
            ),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("__self_SEX: String,"));
        assert!(src.contains("\"SEX\" => self.__self_SEX = value.to_string(),"));
        assert!(src.contains("let __self_SEX = self.table.__self_SEX.clone();"));
        assert!(src.contains("let mut label = String::new();"));
        assert!(src.contains("label = __self_SEX.clone();"));
        assert!(src.contains("let mut same = false;"));
        assert!(src.contains("same = __self_SEX == __self_FED;"));
        // String locals never reach the numeric export map.
        assert!(!src.contains("ctx.locals.insert(\"label\""));
    }

    #[test]
    fn type_error_stops_before_any_text() {
        let d = ModuleBuilder::pred()
            .theta("pop_cl", 1.0)
            .covariate_text("SEX")
            .build()
            .unwrap();
        let block = vec![
            local("cl", Expr::theta("pop_cl")),
            local("cl", Expr::covariate("SEX")),
        ];
        let err = emit_unit(&block, &d, &OdeSolver::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Variable 'cl' has type double and cannot be assigned str"
        );
    }

    #[test]
    fn closed_form_setters_and_solution_reads() {
        let d = ModuleBuilder::closed_form(SolutionKind::EvOneCmtMicro)
            .theta("pop_k", 0.1)
            .eta("iiv_k")
            .build()
            .unwrap();
        let block = vec![
            Stmt::assign(
                AssignTarget::DoseParam {
                    cmt: 0,
                    param: crate::syntax::DoseParam::Alag,
                },
                Expr::theta("pop_k"),
                span(),
            ),
            Stmt::assign(
                AssignTarget::DoseParamWrt {
                    cmt: 0,
                    param: crate::syntax::DoseParam::Alag,
                    wrt: Wrt::Eta("iiv_k".into()),
                    wrt2: None,
                },
                Expr::num(0.5),
                span(),
            ),
            Stmt::assign(
                AssignTarget::SolveArg(ParamKey::plain("K")),
                Expr::theta("pop_k"),
                span(),
            ),
            Stmt::assign(
                AssignTarget::SolveArgWrt {
                    key: ParamKey::plain("K"),
                    wrt: Wrt::Eta("iiv_k".into()),
                    wrt2: Some(Wrt::Eta("iiv_k".into())),
                },
                Expr::num(0.0),
                span(),
            ),
            Stmt::new(StmtKind::Solve, span()),
            local(
                "ipred",
                Expr::Leaf(Leaf::SolvedF)
                    + Expr::deriv(DerivRef::first(DerivOf::SolvedF, Wrt::Eta("iiv_k".into()))),
            ),
            local("a1", Expr::Leaf(Leaf::SolvedA(0))),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("ctx.set_dose_param(0, \"alag\", __self_pop_k);"));
        assert!(src.contains("ctx.set_dose_param_wrt(0, \"alag\", 0, 0.5);"));
        assert!(src.contains("ctx.set_solve_arg(\"K\", __self_pop_k);"));
        assert!(src.contains("ctx.set_solve_arg_wrt2(\"K\", 0, 0, 0.0);"));
        assert!(src.contains("ctx.solve()?;"));
        assert!(src.contains("ipred = ctx.solution.f + ctx.solution.f_wrt(0);"));
        assert!(src.contains("a1 = ctx.solution.a[0];"));
        assert!(src.contains("ModuleKind::ClosedForm"));
    }

    #[test]
    fn solver_settings_are_baked_as_literals() {
        let d = pred_descriptor();
        let block = vec![local("cl", Expr::theta("pop_cl"))];
        let unit = emit_unit(
            &block,
            &d,
            &crate::model::OdeSolver::lsoda(1e-6, 1e-10, 500).unwrap(),
        )
        .unwrap();
        assert!(unit
            .source
            .contains("(\"odeint.solver\".to_string(), ConfigValue::Str(\"lsoda\".to_string()))"));
        assert!(unit
            .source
            .contains("(\"odeint.lsoda.max_steps\".to_string(), ConfigValue::Int(500))"));
        assert!(unit
            .source
            .contains("(\"odeint.lsoda.rel_tol\".to_string(), ConfigValue::Float(1e-6))"));
    }

    #[test]
    fn unassigned_derivative_reads_fall_back_to_zero() {
        let d = pred_descriptor();
        let block = vec![local(
            "k",
            Expr::deriv(DerivRef::first(
                DerivOf::Local("cl".into()),
                Wrt::Eta("iiv_cl".into()),
            )),
        )];
        let src = emit(&block, &d).source;
        assert!(src.contains("k = 0.0;"));
    }

    #[test]
    fn derivative_slots_are_shared_across_branches() {
        let d = pred_descriptor();
        let slot = DerivRef::first(DerivOf::Local("cl".into()), Wrt::Eta("iiv_cl".into()));
        let block = vec![Stmt::new(
            StmtKind::If {
                cond: Expr::binary(BinOp::Gt, Expr::covariate("wt"), Expr::num(70.0)),
                then_body: vec![Stmt::assign(
                    AssignTarget::Deriv(slot.clone()),
                    Expr::num(1.0),
                    span(),
                )],
                else_body: vec![Stmt::assign(
                    AssignTarget::Deriv(slot),
                    Expr::num(2.0),
                    span(),
                )],
            },
            span(),
        )];
        let src = emit(&block, &d).source;
        assert!(src.contains("__X_0 = 1.0;"));
        assert!(src.contains("__X_0 = 2.0;"));
        assert_eq!(src.matches("let mut __X_0 = 0.0;").count(), 1);
        assert!(!src.contains("__X_1"));
    }

    #[test]
    fn emission_is_deterministic() {
        let d = pred_descriptor();
        let block = vec![
            local("cl", Expr::theta("pop_cl") * Expr::covariate("wt")),
            local("k", Expr::local("cl") / Expr::num(70.0)),
            Stmt::new(
                StmtKind::Return {
                    value: Expr::local("k"),
                    kind: ResultKind::Prediction,
                },
                span(),
            ),
        ];
        let a = emit(&block, &d);
        let b = emit(&block, &d);
        assert_eq!(a.source, b.source);
        assert_eq!(a.symbols, b.symbols);
    }

    #[test]
    fn branch_locals_are_not_exported() {
        let d = pred_descriptor();
        let block = vec![
            local("cl", Expr::theta("pop_cl")),
            Stmt::new(
                StmtKind::If {
                    cond: Expr::binary(BinOp::Gt, Expr::covariate("wt"), Expr::num(70.0)),
                    then_body: vec![local("res", Expr::num(1.0))],
                    else_body: vec![],
                },
                span(),
            ),
        ];
        let src = emit(&block, &d).source;
        assert!(src.contains("let mut res = 0.0;"));
        assert!(src.contains("ctx.locals.insert(\"cl\".to_string(), cl);"));
        assert!(!src.contains("ctx.locals.insert(\"res\""));
    }
}
