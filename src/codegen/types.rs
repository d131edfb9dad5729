//! Static value types for the generated unit.
//!
//! The checker runs before any native text is produced: first a typing walk
//! over the lowered block, then the emission walk. A local's type is fixed by
//! its first assignment; numeric kinds are mutually assignable, anything else
//! must match exactly. The walk is flow-insensitive: both arms of an `if`
//! contribute to the table in source order.

use std::collections::HashMap;
use std::fmt;

use crate::error::CodegenError;
use crate::model::{CovKind, ModuleDescriptor};
use crate::syntax::{AssignTarget, BinOp, Block, Expr, Leaf, Span, Stmt, StmtKind, UnaryOp};

/// Scalar type of a value in the generated unit.
///
/// Inference only ever produces `Double`, `Bool`, and `Str`; the remaining
/// kinds round out the vocabulary shared with the host ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Void,
    Double,
    Int,
    Long,
    Bool,
    Str,
    /// Host-side handle; never produced by expression inference.
    Ptr,
}

impl ValueType {
    /// Numeric kinds are mutually assignable and usable in arithmetic;
    /// `bool` counts as numeric so condition flags can flow into expressions.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueType::Double | ValueType::Int | ValueType::Long | ValueType::Bool
        )
    }

    /// Whether a slot of this type can be assigned a value of type `from`.
    pub fn accepts(&self, from: ValueType) -> bool {
        *self == from || (self.is_numeric() && from.is_numeric())
    }

    /// Initializer used when declaring a local of this type.
    pub fn default_literal(&self) -> &'static str {
        match self {
            ValueType::Str => "String::new()",
            ValueType::Bool => "false",
            ValueType::Int | ValueType::Long => "0",
            _ => "0.0",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValueType::Void => "void",
            ValueType::Double => "double",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Bool => "bool",
            ValueType::Str => "str",
            ValueType::Ptr => "ptr",
        };
        f.write_str(text)
    }
}

/// Types assigned to each local, fixed at first assignment.
#[derive(Debug, Default, Clone)]
pub struct TypeTable {
    locals: HashMap<String, ValueType>,
}

impl TypeTable {
    /// Type of a local; derivative temps and unseen names read as double.
    pub fn local(&self, name: &str) -> ValueType {
        self.locals.get(name).copied().unwrap_or(ValueType::Double)
    }
}

/// Type-check a lowered block, returning the table of local types.
///
/// The first violation aborts; the emitter never runs on an ill-typed block.
pub fn check_block(
    block: &Block,
    descriptor: &ModuleDescriptor,
) -> Result<TypeTable, CodegenError> {
    let mut table = TypeTable::default();
    check_stmts(block, descriptor, &mut table)?;
    Ok(table)
}

fn check_stmts(
    stmts: &[Stmt],
    descriptor: &ModuleDescriptor,
    table: &mut TypeTable,
) -> Result<(), CodegenError> {
    for stmt in stmts {
        check_stmt(stmt, descriptor, table)?;
    }
    Ok(())
}

fn check_stmt(
    stmt: &Stmt,
    descriptor: &ModuleDescriptor,
    table: &mut TypeTable,
) -> Result<(), CodegenError> {
    match &stmt.kind {
        StmtKind::Assign { target, value } => {
            let ty = infer(value, descriptor, table, stmt.span)?;
            match target {
                AssignTarget::Local(name) => match table.locals.get(name) {
                    Some(declared) if !declared.accepts(ty) => Err(CodegenError::type_conflict(
                        name,
                        declared.to_string(),
                        ty.to_string(),
                        stmt.span,
                    )),
                    Some(_) => Ok(()),
                    None => {
                        table.locals.insert(name.clone(), ty);
                        Ok(())
                    }
                },
                _ if !ty.is_numeric() => Err(CodegenError::type_error(
                    format!(
                        "Cannot assign a {} value to '{}'",
                        ty,
                        crate::syntax::target_text(target)
                    ),
                    stmt.span,
                )),
                _ => Ok(()),
            }
        }
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            let cty = infer(cond, descriptor, table, stmt.span)?;
            if !cty.is_numeric() {
                return Err(CodegenError::type_error(
                    format!("Condition is not bool-like: {}", cty),
                    stmt.span,
                ));
            }
            check_stmts(then_body, descriptor, table)?;
            check_stmts(else_body, descriptor, table)
        }
        StmtKind::Return { value, .. } => {
            let ty = infer(value, descriptor, table, stmt.span)?;
            if !ty.is_numeric() {
                return Err(CodegenError::type_error(
                    format!("Return value is not numeric: {}", ty),
                    stmt.span,
                ));
            }
            Ok(())
        }
        StmtKind::Solve => Ok(()),
    }
}

/// Infer the type of an expression against the descriptor and the locals
/// typed so far. `span` anchors any error to the enclosing statement.
pub fn infer(
    expr: &Expr,
    descriptor: &ModuleDescriptor,
    table: &TypeTable,
    span: Span,
) -> Result<ValueType, CodegenError> {
    Ok(match expr {
        Expr::Num(_) => ValueType::Double,
        Expr::Leaf(leaf) => leaf_type(leaf, descriptor, table),
        Expr::Deriv(_) => ValueType::Double,
        Expr::Unary { op, operand } => {
            require_numeric(infer(operand, descriptor, table, span)?, span)?;
            match op {
                UnaryOp::Neg => ValueType::Double,
                UnaryOp::Not => ValueType::Bool,
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let lt = infer(lhs, descriptor, table, span)?;
            let rt = infer(rhs, descriptor, table, span)?;
            if matches!(op, BinOp::Eq | BinOp::Ne)
                && lt == ValueType::Str
                && rt == ValueType::Str
            {
                // String equality is the one non-numeric comparison.
                ValueType::Bool
            } else {
                require_numeric(lt, span)?;
                require_numeric(rt, span)?;
                if op.is_boolean() {
                    ValueType::Bool
                } else {
                    ValueType::Double
                }
            }
        }
        Expr::Func { f, args } => {
            if args.len() != f.arity() {
                return Err(CodegenError::type_error(
                    format!(
                        "Function '{}' expects {} arguments but got {}",
                        f.name(),
                        f.arity(),
                        args.len()
                    ),
                    span,
                ));
            }
            for arg in args {
                let ty = infer(arg, descriptor, table, span)?;
                if !ty.is_numeric() {
                    return Err(CodegenError::type_error(
                        format!("Function '{}' cannot take a {} argument", f.name(), ty),
                        span,
                    ));
                }
            }
            ValueType::Double
        }
        Expr::Call { name, .. } => {
            return Err(CodegenError::type_error(
                format!("Unresolved helper call '{}'", name),
                span,
            ));
        }
        Expr::Ternary {
            cond,
            then,
            orelse,
        } => {
            let cty = infer(cond, descriptor, table, span)?;
            if !cty.is_numeric() {
                return Err(CodegenError::type_error(
                    format!("Condition is not bool-like: {}", cty),
                    span,
                ));
            }
            let tt = infer(then, descriptor, table, span)?;
            let et = infer(orelse, descriptor, table, span)?;
            if tt == et {
                tt
            } else if tt.is_numeric() && et.is_numeric() {
                ValueType::Double
            } else {
                return Err(CodegenError::type_error(
                    format!("Ternary arms have incompatible types {} and {}", tt, et),
                    span,
                ));
            }
        }
    })
}

fn leaf_type(leaf: &Leaf, descriptor: &ModuleDescriptor, table: &TypeTable) -> ValueType {
    match leaf {
        Leaf::Local(name) => table.local(name),
        Leaf::Covariate(name) => match descriptor.covariate_kind(name) {
            Some(CovKind::Text) => ValueType::Str,
            _ => ValueType::Double,
        },
        Leaf::FirstOrder | Leaf::SecondOrder => ValueType::Bool,
        _ => ValueType::Double,
    }
}

fn require_numeric(ty: ValueType, span: Span) -> Result<(), CodegenError> {
    if ty.is_numeric() {
        Ok(())
    } else {
        Err(CodegenError::type_error(
            format!("Operand is not numeric: {}", ty),
            span,
        ))
    }
}
