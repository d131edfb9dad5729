//! Model-source syntax: expressions, statements, parser and printer.

pub mod expr;
pub mod parser;
pub mod span;
pub mod stmt;
pub mod unparse;

pub use expr::{BinOp, DerivOf, DerivRef, Expr, Intrinsic, Leaf, Number, UnaryOp, Wrt};
pub use parser::{parse_model, ParsedModel};
pub use span::Span;
pub use stmt::{AssignTarget, Block, DoseParam, ParamKey, ResultKind, Stmt, StmtKind};
pub use unparse::{expr_text, stmt_headline, target_text, unparse};
