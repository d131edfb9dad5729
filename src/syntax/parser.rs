//! Parser for the model-body DSL.
//!
//! The surface is a small C-style statement language: newline- or
//! semicolon-terminated assignments, `if`/`else` blocks, ternaries, helper
//! definitions (`fn name(a, b = 1) { ... }`), compartment targets
//! (`dadt(1) = ...`, `cmt(1).alag = ...`) and the closed-form
//! `sln = solve(kind, key = expr, ...)` call. Identifiers resolve against
//! the module descriptor; undeclared names become plain locals and are
//! scope-checked later.
//!
//! Tokenization and precedence climbing follow the usual two-phase shape;
//! every token carries a [`Span`] so errors can point back into the source.

use crate::error::ParseError;
use crate::inline::{FunctionDef, FunctionEnv, InlineStage, Param};
use crate::model::solution::{solve_args, SolutionKind};
use crate::model::{ModuleDescriptor, ModuleKind};
use crate::syntax::expr::{BinOp, Expr, Intrinsic, Leaf, UnaryOp};
use crate::syntax::span::Span;
use crate::syntax::stmt::{AssignTarget, Block, DoseParam, ResultKind, Stmt, StmtKind};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Num(f64),
    Ident(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Question,
    Colon,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Bang,
    /// Statement terminator: newline or `;`.
    End,
    /// A trailing `# nodiff` directive.
    Nodiff,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Num(v) => format!("number `{}`", v),
            TokenKind::Ident(s) => format!("`{}`", s),
            TokenKind::End => "end of statement".to_string(),
            TokenKind::Nodiff => "`# nodiff`".to_string(),
            other => format!("`{}`", other.literal()),
        }
    }

    fn literal(&self) -> &'static str {
        match self {
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Question => "?",
            TokenKind::Colon => ":",
            TokenKind::Assign => "=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Caret => "^",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::EqEq => "==",
            TokenKind::Ne => "!=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Bang => "!",
            _ => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Split model source into spanned tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut line: u32 = 1;
    let mut col: u32 = 1;
    let mut chars = source.chars().peekable();

    macro_rules! push {
        ($kind:expr, $len:expr) => {
            tokens.push(Token {
                kind: $kind,
                span: Span::new(line, col, $len),
            })
        };
    }

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                // Collapse runs of terminators.
                if !matches!(tokens.last().map(|t: &Token| &t.kind), Some(TokenKind::End) | None) {
                    push!(TokenKind::End, 1);
                }
                chars.next();
                line += 1;
                col = 1;
            }
            ';' => {
                if !matches!(tokens.last().map(|t: &Token| &t.kind), Some(TokenKind::End) | None) {
                    push!(TokenKind::End, 1);
                }
                chars.next();
                col += 1;
            }
            ' ' | '\t' | '\r' => {
                chars.next();
                col += 1;
            }
            '#' => {
                let start_col = col;
                let mut text = String::new();
                while let Some(&cc) = chars.peek() {
                    if cc == '\n' {
                        break;
                    }
                    text.push(cc);
                    chars.next();
                    col += 1;
                }
                let trimmed = text.trim_start_matches('#').trim();
                if trimmed == "nodiff" {
                    tokens.push(Token {
                        kind: TokenKind::Nodiff,
                        span: Span::new(line, start_col, text.len() as u32),
                    });
                }
            }
            '0'..='9' | '.' => {
                // `.` only starts a number when followed by a digit; the
                // attribute dot is handled below.
                if c == '.' {
                    let mut clone = chars.clone();
                    clone.next();
                    if !matches!(clone.peek(), Some('0'..='9')) {
                        push!(TokenKind::Dot, 1);
                        chars.next();
                        col += 1;
                        continue;
                    }
                }
                let start_col = col;
                let mut text = String::new();
                while let Some(&cc) = chars.peek() {
                    if cc.is_ascii_digit() || cc == '.' {
                        text.push(cc);
                        chars.next();
                        col += 1;
                    } else if cc == 'e' || cc == 'E' {
                        let mut clone = chars.clone();
                        clone.next();
                        match clone.peek() {
                            Some('+' | '-') => {
                                clone.next();
                                if !matches!(clone.peek(), Some('0'..='9')) {
                                    break;
                                }
                                text.push(cc);
                                chars.next();
                                col += 1;
                                let sign = chars.next().ok_or_else(|| {
                                    ParseError::new(
                                        "Unterminated exponent",
                                        Span::new(line, col, 1),
                                    )
                                })?;
                                text.push(sign);
                                col += 1;
                            }
                            Some('0'..='9') => {
                                text.push(cc);
                                chars.next();
                                col += 1;
                            }
                            _ => break,
                        }
                    } else {
                        break;
                    }
                }
                let value: f64 = text.parse().map_err(|_| {
                    ParseError::new(
                        format!("Malformed number literal '{}'", text),
                        Span::new(line, start_col, text.len() as u32),
                    )
                })?;
                tokens.push(Token {
                    kind: TokenKind::Num(value),
                    span: Span::new(line, start_col, text.len() as u32),
                });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start_col = col;
                let mut text = String::new();
                while let Some(&cc) = chars.peek() {
                    if cc.is_ascii_alphanumeric() || cc == '_' {
                        text.push(cc);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(text.clone()),
                    span: Span::new(line, start_col, text.len() as u32),
                });
            }
            _ => {
                let two: String = {
                    let mut clone = chars.clone();
                    let a = clone.next().unwrap_or(' ');
                    let b = clone.next().unwrap_or(' ');
                    [a, b].iter().collect()
                };
                let (kind, len) = match two.as_str() {
                    "<=" => (TokenKind::Le, 2),
                    ">=" => (TokenKind::Ge, 2),
                    "==" => (TokenKind::EqEq, 2),
                    "!=" => (TokenKind::Ne, 2),
                    "&&" => (TokenKind::AndAnd, 2),
                    "||" => (TokenKind::OrOr, 2),
                    _ => match c {
                        '(' => (TokenKind::LParen, 1),
                        ')' => (TokenKind::RParen, 1),
                        '{' => (TokenKind::LBrace, 1),
                        '}' => (TokenKind::RBrace, 1),
                        ',' => (TokenKind::Comma, 1),
                        '?' => (TokenKind::Question, 1),
                        ':' => (TokenKind::Colon, 1),
                        '=' => (TokenKind::Assign, 1),
                        '+' => (TokenKind::Plus, 1),
                        '-' => (TokenKind::Minus, 1),
                        '*' => (TokenKind::Star, 1),
                        '/' => (TokenKind::Slash, 1),
                        '^' => (TokenKind::Caret, 1),
                        '<' => (TokenKind::Lt, 1),
                        '>' => (TokenKind::Gt, 1),
                        '!' => (TokenKind::Bang, 1),
                        other => {
                            return Err(ParseError::new(
                                format!("Unexpected character '{}'", other),
                                Span::new(line, col, 1),
                            ));
                        }
                    },
                };
                push!(kind, len);
                for _ in 0..len {
                    chars.next();
                }
                col += len;
            }
        }
    }
    if !matches!(tokens.last().map(|t: &Token| &t.kind), Some(TokenKind::End) | None) {
        tokens.push(Token {
            kind: TokenKind::End,
            span: Span::new(line, col, 1),
        });
    }
    Ok(tokens)
}

/// Result of parsing one model source: the prediction body plus the helper
/// definitions collected from `fn` items.
#[derive(Debug, Clone)]
pub struct ParsedModel {
    pub body: Block,
    pub functions: FunctionEnv,
}

/// Parse model source against a descriptor.
pub fn parse_model(
    source: &str,
    descriptor: &ModuleDescriptor,
) -> Result<ParsedModel, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        descriptor,
        solve_binding: None,
        solved: false,
        functions: FunctionEnv::new(),
        in_function: false,
    };
    let body = parser.parse_top()?;
    Ok(ParsedModel {
        body,
        functions: parser.functions,
    })
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    descriptor: &'a ModuleDescriptor,
    solve_binding: Option<String>,
    solved: bool,
    functions: FunctionEnv,
    in_function: bool,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_ahead(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + n).map(|t| &t.kind)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn here(&self) -> Span {
        self.peek()
            .map(|t| t.span)
            .or_else(|| self.tokens.last().map(|t| t.span))
            .unwrap_or_default()
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        match self.peek() {
            Some(t) if t.kind == kind => Ok(self.bump().unwrap_or_else(|| unreachable!())),
            Some(t) => Err(ParseError::unexpected(
                t.kind.describe(),
                &[what],
                t.span,
            )),
            None => Err(ParseError::unexpected(
                "end of input",
                &[what],
                self.here(),
            )),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Span), ParseError> {
        match self.bump() {
            Some(Token {
                kind: TokenKind::Ident(name),
                span,
            }) => Ok((name, span)),
            Some(t) => Err(ParseError::unexpected(t.kind.describe(), &[what], t.span)),
            None => Err(ParseError::unexpected("end of input", &[what], self.here())),
        }
    }

    fn skip_ends(&mut self) {
        while matches!(self.peek_kind(), Some(TokenKind::End)) {
            self.pos += 1;
        }
    }

    fn end_statement(&mut self, stmt: &mut Stmt) -> Result<(), ParseError> {
        if matches!(self.peek_kind(), Some(TokenKind::Nodiff)) {
            self.bump();
            stmt.nodiff = true;
        }
        match self.peek_kind() {
            Some(TokenKind::End) => {
                self.bump();
                Ok(())
            }
            // A closing brace also ends the statement; the block parser
            // consumes it.
            Some(TokenKind::RBrace) | None => Ok(()),
            // Chained assignment: `a = b = 1`.
            Some(TokenKind::Assign) => Err(ParseError::new(
                "Only single assignment is supported",
                self.here(),
            )),
            Some(other) => Err(ParseError::unexpected(
                other.describe(),
                &["end of statement"],
                self.here(),
            )),
        }
    }

    fn parse_top(&mut self) -> Result<Block, ParseError> {
        let mut body = Vec::new();
        loop {
            self.skip_ends();
            match self.peek_kind() {
                None => break,
                Some(TokenKind::Ident(name)) if name == "fn" => {
                    self.parse_function()?;
                }
                _ => self.parse_stmt_into(&mut body)?,
            }
        }
        Ok(body)
    }

    fn parse_function(&mut self) -> Result<(), ParseError> {
        self.bump(); // fn
        let (name, name_span) = self.expect_ident("function name")?;
        if Intrinsic::from_name(&name).is_some() {
            return Err(ParseError::new(
                format!("Cannot redefine builtin '{}'", name),
                name_span,
            ));
        }
        if self.functions.get(&name).is_some() {
            return Err(ParseError::new(
                format!("Function '{}' is defined twice", name),
                name_span,
            ));
        }
        self.expect(TokenKind::LParen, "(")?;
        let mut params: Vec<Param> = Vec::new();
        let mut seen_default = false;
        while !matches!(self.peek_kind(), Some(TokenKind::RParen)) {
            let (pname, pspan) = self.expect_ident("parameter name")?;
            if params.iter().any(|p| p.name == pname) {
                return Err(ParseError::new(
                    format!("Duplicate parameter '{}' in '{}'", pname, name),
                    pspan,
                ));
            }
            let default = if matches!(self.peek_kind(), Some(TokenKind::Assign)) {
                self.bump();
                seen_default = true;
                Some(self.parse_expr()?)
            } else {
                if seen_default {
                    return Err(ParseError::new(
                        format!(
                            "Parameter '{}' without default follows a defaulted parameter",
                            pname
                        ),
                        pspan,
                    ));
                }
                None
            };
            params.push(Param {
                name: pname,
                default,
            });
            if matches!(self.peek_kind(), Some(TokenKind::Comma)) {
                self.bump();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, ")")?;
        let was_in_function = self.in_function;
        self.in_function = true;
        let body = self.parse_braced_block()?;
        self.in_function = was_in_function;
        self.functions
            .define(FunctionDef::new(name, params, body, InlineStage::Always));
        Ok(())
    }

    fn parse_braced_block(&mut self) -> Result<Block, ParseError> {
        self.expect(TokenKind::LBrace, "{")?;
        let mut body = Vec::new();
        loop {
            self.skip_ends();
            match self.peek_kind() {
                Some(TokenKind::RBrace) => {
                    self.bump();
                    break;
                }
                None => {
                    return Err(ParseError::unexpected(
                        "end of input",
                        &["}"],
                        self.here(),
                    ));
                }
                _ => self.parse_stmt_into(&mut body)?,
            }
        }
        Ok(body)
    }

    /// Parse one surface statement. A `solve(...)` call expands into several
    /// statements, hence the sink argument.
    fn parse_stmt_into(&mut self, body: &mut Vec<Stmt>) -> Result<(), ParseError> {
        let start = self.here();
        match self.peek_kind() {
            Some(TokenKind::Ident(name)) => match name.as_str() {
                "if" => {
                    let mut stmt = self.parse_if()?;
                    // `} # nodiff` marks the whole conditional.
                    if matches!(self.peek_kind(), Some(TokenKind::Nodiff)) {
                        self.bump();
                        stmt.nodiff = true;
                    }
                    body.push(stmt);
                    Ok(())
                }
                "return" => {
                    let stmt = self.parse_return(start)?;
                    body.push(stmt);
                    Ok(())
                }
                "solve" if matches!(self.peek_ahead(1), Some(TokenKind::LParen)) => {
                    let stmts = self.parse_solve(None, start)?;
                    body.extend(stmts);
                    Ok(())
                }
                "while" | "for" | "loop" | "match" | "break" | "continue" => {
                    Err(ParseError::new(
                        format!("Cannot handle \"{}\" statement yet", name),
                        start,
                    ))
                }
                _ => self.parse_assign_into(start, body),
            },
            Some(other) => Err(ParseError::unexpected(
                other.describe(),
                &["statement"],
                start,
            )),
            None => Err(ParseError::unexpected("end of input", &["statement"], start)),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let start = self.here();
        self.bump(); // if
        self.expect(TokenKind::LParen, "(")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, ")")?;
        self.skip_ends();
        let then_body = self.parse_braced_block()?;
        self.skip_ends();
        let else_body = if matches!(self.peek_kind(), Some(TokenKind::Ident(n)) if n == "else")
        {
            self.bump();
            self.skip_ends();
            if matches!(self.peek_kind(), Some(TokenKind::Ident(n)) if n == "if") {
                vec![self.parse_if()?]
            } else {
                self.parse_braced_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::new(
            StmtKind::If {
                cond,
                then_body,
                else_body,
            },
            start,
        ))
    }

    fn parse_return(&mut self, start: Span) -> Result<Stmt, ParseError> {
        self.bump(); // return
        if matches!(self.peek_kind(), Some(TokenKind::End) | None) {
            return Err(ParseError::new(
                "Return statement must return an expression. For example, use `return IPRED` instead of `return`",
                start,
            ));
        }
        // `return prediction(e)` / `return likelihood(e)` / `return neg2ll(e)`
        // or a bare expression (treated as a prediction).
        let (kind, value) = if let Some(TokenKind::Ident(name)) = self.peek_kind() {
            let marker = match name.as_str() {
                "prediction" => Some(ResultKind::Prediction),
                "likelihood" => Some(ResultKind::Likelihood),
                "neg2ll" => Some(ResultKind::NegTwoLogLikelihood),
                _ => None,
            };
            match (marker, self.peek_ahead(1)) {
                (Some(kind), Some(TokenKind::LParen)) => {
                    self.bump();
                    self.expect(TokenKind::LParen, "(")?;
                    let value = self.parse_expr()?;
                    self.expect(TokenKind::RParen, ")")?;
                    (kind, value)
                }
                _ => (ResultKind::Prediction, self.parse_expr()?),
            }
        } else {
            (ResultKind::Prediction, self.parse_expr()?)
        };
        let mut stmt = Stmt::new(StmtKind::Return { value, kind }, start);
        self.end_statement(&mut stmt)?;
        Ok(stmt)
    }

    fn parse_assign_into(
        &mut self,
        start: Span,
        body: &mut Vec<Stmt>,
    ) -> Result<(), ParseError> {
        let (name, name_span) = self.expect_ident("identifier")?;
        // Compartment targets.
        if name == "dadt" && matches!(self.peek_kind(), Some(TokenKind::LParen)) {
            let cmt = self.parse_cmt_index()?;
            self.expect(TokenKind::Assign, "=")?;
            let value = self.parse_expr()?;
            let mut stmt = Stmt::assign(AssignTarget::Dadt(cmt), value, start);
            self.end_statement(&mut stmt)?;
            body.push(stmt);
            return Ok(());
        }
        if name == "cmt" && matches!(self.peek_kind(), Some(TokenKind::LParen)) {
            let cmt = self.parse_cmt_index()?;
            self.expect(TokenKind::Dot, ".")?;
            let (attr, attr_span) = self.expect_ident("dosing attribute")?;
            let param = DoseParam::from_name(&attr).ok_or_else(|| {
                ParseError::new(
                    format!("Unknown dosing attribute '{}'", attr),
                    attr_span,
                )
            })?;
            self.expect(TokenKind::Assign, "=")?;
            let value = self.parse_expr()?;
            let mut stmt = Stmt::assign(AssignTarget::DoseParam { cmt, param }, value, start);
            self.end_statement(&mut stmt)?;
            body.push(stmt);
            return Ok(());
        }
        if !matches!(self.peek_kind(), Some(TokenKind::Assign)) {
            return Err(ParseError::unexpected(
                self.peek_kind()
                    .map(|k| k.describe())
                    .unwrap_or_else(|| "end of input".to_string()),
                &["="],
                self.here(),
            ));
        }
        if self.descriptor.resolve(&name).is_some() {
            return Err(ParseError::new(
                format!("Cannot assign to declared symbol '{}'", name),
                name_span,
            ));
        }
        self.bump(); // =
        // `x = solve(...)` binds the solution handle.
        if matches!(self.peek_kind(), Some(TokenKind::Ident(n)) if n == "solve")
            && matches!(self.peek_ahead(1), Some(TokenKind::LParen))
        {
            let stmts = self.parse_solve(Some(name), start)?;
            body.extend(stmts);
            return Ok(());
        }
        let value = self.parse_expr()?;
        let mut stmt = Stmt::assign(AssignTarget::Local(name), value, start);
        self.end_statement(&mut stmt)?;
        body.push(stmt);
        Ok(())
    }

    /// `( n )` with `n` a 1-based integer literal; returns the 0-based index.
    fn parse_cmt_index(&mut self) -> Result<usize, ParseError> {
        self.expect(TokenKind::LParen, "(")?;
        let tok = self.bump();
        let (value, span) = match tok {
            Some(Token {
                kind: TokenKind::Num(v),
                span,
            }) => (v, span),
            Some(t) => {
                return Err(ParseError::unexpected(
                    t.kind.describe(),
                    &["compartment number"],
                    t.span,
                ))
            }
            None => {
                return Err(ParseError::unexpected(
                    "end of input",
                    &["compartment number"],
                    self.here(),
                ))
            }
        };
        self.expect(TokenKind::RParen, ")")?;
        if value < 1.0 || value.fract() != 0.0 {
            return Err(ParseError::new(
                format!("Compartment number must be a positive integer, got {}", value),
                span,
            ));
        }
        let idx = value as usize - 1;
        if self.descriptor.n_cmt > 0 && idx >= self.descriptor.n_cmt {
            return Err(ParseError::new(
                format!(
                    "Compartment {} is out of range (model has {} compartments)",
                    value, self.descriptor.n_cmt
                ),
                span,
            ));
        }
        Ok(idx)
    }

    /// Parse `solve(kind, key = expr, ...)`, returning the solve-argument
    /// assignments followed by the `Solve` trigger.
    fn parse_solve(
        &mut self,
        binder: Option<String>,
        start: Span,
    ) -> Result<Vec<Stmt>, ParseError> {
        if self.descriptor.kind != ModuleKind::ClosedForm {
            return Err(ParseError::new(
                "solve() is only available in closed-form models",
                start,
            ));
        }
        if self.solved {
            return Err(ParseError::new(
                "Model already contains a solve() statement",
                start,
            ));
        }
        self.bump(); // solve
        self.expect(TokenKind::LParen, "(")?;
        let (kind_name, kind_span) = self.expect_ident("closed-form solution name")?;
        let kind = SolutionKind::from_name(&kind_name).ok_or_else(|| {
            ParseError::new(
                format!("Unknown closed-form solution '{}'", kind_name),
                kind_span,
            )
        })?;
        let mut given: Vec<(String, Expr)> = Vec::new();
        while matches!(self.peek_kind(), Some(TokenKind::Comma)) {
            self.bump();
            let (kw, kw_span) = self.expect_ident("parameter keyword")?;
            if given.iter().any(|(k, _)| *k == kw) {
                return Err(ParseError::new(
                    format!("Parameter '{}' given twice", kw),
                    kw_span,
                ));
            }
            self.expect(TokenKind::Assign, "=")?;
            let value = self.parse_expr()?;
            given.push((kw, value));
        }
        self.expect(TokenKind::RParen, ")")?;
        let args = solve_args(kind, &given)
            .map_err(|e| ParseError::new(e.to_string(), start))?;
        let mut stmts: Vec<Stmt> = args
            .into_iter()
            .map(|(key, expr)| Stmt::assign(AssignTarget::SolveArg(key), expr, start))
            .collect();
        let mut trigger = Stmt::new(StmtKind::Solve, start);
        self.end_statement(&mut trigger)?;
        stmts.push(trigger);
        self.solve_binding = binder;
        self.solved = true;
        Ok(stmts)
    }

    // ── expressions ──

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if matches!(self.peek_kind(), Some(TokenKind::Question)) {
            self.bump();
            let then = self.parse_ternary()?;
            self.expect(TokenKind::Colon, ":")?;
            let orelse = self.parse_ternary()?;
            Ok(Expr::ternary(cond, then, orelse))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek_kind(), Some(TokenKind::OrOr)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek_kind(), Some(TokenKind::AndAnd)) {
            self.bump();
            let rhs = self.parse_equality()?;
            lhs = Expr::binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::EqEq) => BinOp::Eq,
                Some(TokenKind::Ne) => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_comparison()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Lt) => BinOp::Lt,
                Some(TokenKind::Le) => BinOp::Le,
                Some(TokenKind::Gt) => BinOp::Gt,
                Some(TokenKind::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_kind() {
            Some(TokenKind::Minus) => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(-operand)
            }
            Some(TokenKind::Bang) => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: std::sync::Arc::new(operand),
                })
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if matches!(self.peek_kind(), Some(TokenKind::Caret)) {
            self.bump();
            // Right-associative; `-` binds looser so the exponent may carry
            // its own unary minus.
            let exponent = self.parse_unary()?;
            Ok(base.pow(exponent))
        } else {
            Ok(base)
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Some(Token {
                kind: TokenKind::Num(v),
                ..
            }) => Ok(Expr::num(v)),
            Some(Token {
                kind: TokenKind::LParen,
                ..
            }) => {
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, ")")?;
                Ok(inner)
            }
            Some(Token {
                kind: TokenKind::Ident(name),
                span,
            }) => self.parse_ident_expr(name, span),
            Some(t) => Err(ParseError::unexpected(
                t.kind.describe(),
                &["expression"],
                t.span,
            )),
            None => Err(ParseError::unexpected(
                "end of input",
                &["expression"],
                self.here(),
            )),
        }
    }

    fn parse_ident_expr(&mut self, name: String, span: Span) -> Result<Expr, ParseError> {
        // Solution handle access: `sln.f`, `sln.a(2)`.
        if Some(&name) == self.solve_binding.as_ref()
            && matches!(self.peek_kind(), Some(TokenKind::Dot))
        {
            self.bump();
            let (attr, attr_span) = self.expect_ident("`f` or `a`")?;
            return match attr.as_str() {
                "f" => Ok(Expr::Leaf(Leaf::SolvedF)),
                "a" => {
                    let idx = self.parse_cmt_index()?;
                    Ok(Expr::Leaf(Leaf::SolvedA(idx)))
                }
                other => Err(ParseError::new(
                    format!("Unknown solution attribute '{}'", other),
                    attr_span,
                )),
            };
        }
        // Compartment amount: `a(1)`.
        if name == "a" && matches!(self.peek_kind(), Some(TokenKind::LParen)) {
            let idx = self.parse_cmt_index()?;
            return Ok(Expr::Leaf(Leaf::Amt(idx)));
        }
        // Calls: intrinsics and user helpers.
        if matches!(self.peek_kind(), Some(TokenKind::LParen)) {
            return self.parse_call(name, span);
        }
        match name.as_str() {
            "t" => Ok(Expr::Leaf(Leaf::Time)),
            "FIRST_ORDER" => Ok(Expr::Leaf(Leaf::FirstOrder)),
            "SECOND_ORDER" => Ok(Expr::Leaf(Leaf::SecondOrder)),
            _ => match self.descriptor.resolve(&name) {
                Some(leaf) => Ok(Expr::Leaf(leaf)),
                None => Ok(Expr::Leaf(Leaf::Local(name))),
            },
        }
    }

    fn parse_call(&mut self, name: String, span: Span) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen, "(")?;
        let mut args: Vec<Expr> = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !matches!(self.peek_kind(), Some(TokenKind::RParen)) {
            // A keyword argument is `ident =` (but not `ident ==`).
            let is_kwarg = matches!(self.peek_kind(), Some(TokenKind::Ident(_)))
                && matches!(self.peek_ahead(1), Some(TokenKind::Assign));
            if is_kwarg {
                let (kw, kw_span) = self.expect_ident("keyword")?;
                if kwargs.iter().any(|(k, _)| *k == kw) {
                    return Err(ParseError::new(
                        format!("Keyword argument '{}' given twice", kw),
                        kw_span,
                    ));
                }
                self.bump(); // =
                kwargs.push((kw, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(ParseError::new(
                        "Positional argument follows keyword argument",
                        self.here(),
                    ));
                }
                args.push(self.parse_expr()?);
            }
            if matches!(self.peek_kind(), Some(TokenKind::Comma)) {
                self.bump();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, ")")?;
        if matches!(name.as_str(), "prediction" | "likelihood" | "neg2ll") {
            return Err(ParseError::new("Always use `return` for `likelihood`", span));
        }
        // `solve` is a statement form; in expression position it can only be
        // the right-hand side of a plain binding, which parse_assign handles.
        if name == "solve" {
            return Err(ParseError::new("Invalid solve assignment target", span));
        }
        if let Some(intrinsic) = Intrinsic::from_name(&name) {
            if !kwargs.is_empty() {
                return Err(ParseError::new(
                    format!("Builtin '{}' does not take keyword arguments", name),
                    span,
                ));
            }
            if args.len() != intrinsic.arity() {
                return Err(ParseError::new(
                    format!(
                        "Function '{}' takes {} argument{} but {} were given",
                        name,
                        intrinsic.arity(),
                        if intrinsic.arity() == 1 { "" } else { "s" },
                        args.len()
                    ),
                    span,
                ));
            }
            return Ok(Expr::Func {
                f: intrinsic,
                args,
            });
        }
        Ok(Expr::Call { name, args, kwargs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModuleBuilder;

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
    fn resolves_declared_symbols() {
        let d = pred_descriptor();
        let parsed = parse_model("cl = tvcl * exp(iiv_cl)\n", &d).unwrap();
        assert_eq!(parsed.body.len(), 1);
        match &parsed.body[0].kind {
            StmtKind::Assign { target, value } => {
                assert_eq!(target, &AssignTarget::Local("cl".to_string()));
                assert_eq!(
                    value,
                    &(Expr::theta("tvcl") * Expr::eta("iiv_cl").exp())
                );
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn statements_carry_line_spans() {
        let d = pred_descriptor();
        let parsed = parse_model("cl = tvcl\nv = tvv\n", &d).unwrap();
        assert_eq!(parsed.body[0].span.line, 1);
        assert_eq!(parsed.body[1].span.line, 2);
    }

    #[test]
    fn if_else_chain_parses() {
        let d = pred_descriptor();
        let src = "if (wt > 70) {\n  f = 1\n} else if (wt > 50) {\n  f = 0.75\n} else {\n  f = 0.5\n}\n";
        let parsed = parse_model(src, &d).unwrap();
        match &parsed.body[0].kind {
            StmtKind::If {
                else_body, ..
            } => match &else_body[0].kind {
                StmtKind::If { else_body, .. } => assert_eq!(else_body.len(), 1),
                other => panic!("expected nested if, got {:?}", other),
            },
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn return_markers_set_result_kind() {
        let d = pred_descriptor();
        let parsed = parse_model("return likelihood(l)\n", &d).unwrap();
        assert!(matches!(
            parsed.body[0].kind,
            StmtKind::Return {
                kind: ResultKind::Likelihood,
                ..
            }
        ));
        let parsed = parse_model("return ipred\n", &d).unwrap();
        assert!(matches!(
            parsed.body[0].kind,
            StmtKind::Return {
                kind: ResultKind::Prediction,
                ..
            }
        ));
    }

    #[test]
    fn bare_return_is_rejected_with_guidance() {
        let d = pred_descriptor();
        let err = parse_model("return\n", &d).unwrap_err();
        assert!(err
            .message
            .contains("use `return IPRED` instead of `return`"));
    }

    #[test]
    fn chained_assignment_is_rejected() {
        let d = pred_descriptor();
        let err = parse_model("a = b = 1\n", &d).unwrap_err();
        assert_eq!(err.message, "Only single assignment is supported");
    }

    #[test]
    fn loop_keywords_are_rejected() {
        let d = pred_descriptor();
        let err = parse_model("while (wt > 0) {\n  cl = 1\n}\n", &d).unwrap_err();
        assert_eq!(err.message, "Cannot handle \"while\" statement yet");
    }

    #[test]
    fn solve_in_expression_position_is_rejected() {
        let d = pred_descriptor();
        let err = parse_model("y = 1 + solve(ev_one_cmt, cl = 1)\n", &d).unwrap_err();
        assert_eq!(err.message, "Invalid solve assignment target");
    }

    #[test]
    fn nodiff_directive_marks_statement() {
        let d = pred_descriptor();
        let parsed = parse_model("k = 3.0 # nodiff\n", &d).unwrap();
        assert!(parsed.body[0].nodiff);
    }

    #[test]
    fn nodiff_directive_marks_whole_if_blocks() {
        let d = pred_descriptor();
        let parsed =
            parse_model("k = 1.0\nif (wt > 70.0) {\n  k = 2.0\n} # nodiff\n", &d).unwrap();
        assert!(!parsed.body[0].nodiff);
        assert!(parsed.body[1].nodiff);
        assert!(matches!(parsed.body[1].kind, StmtKind::If { .. }));
    }

    #[test]
    fn result_markers_outside_return_are_rejected() {
        let d = pred_descriptor();
        let err = parse_model("y = likelihood(wt)\n", &d).unwrap_err();
        assert!(err.message.contains("Always use `return` for `likelihood`"));
    }

    #[test]
    fn helper_definitions_are_collected() {
        let d = pred_descriptor();
        let src = "fn emax(c, e0, em, ec50 = 1) {\n  return e0 + em * c / (ec50 + c)\n}\neff = emax(cp, 0, 1)\n";
        let parsed = parse_model(src, &d).unwrap();
        assert_eq!(parsed.body.len(), 1);
        let def = parsed.functions.get("emax").unwrap();
        assert_eq!(def.params.len(), 4);
        assert!(def.params[3].default.is_some());
    }

    #[test]
    fn default_before_required_is_rejected() {
        let d = pred_descriptor();
        let err = parse_model("fn bad(a = 1, b) { return a + b }\n", &d).unwrap_err();
        assert!(err.message.contains("without default"));
    }

    #[test]
    fn dadt_targets_parse_one_based() {
        let d = ModuleBuilder::ode(2)
            .theta("tvcl", 1.0)
            .eta("iiv_cl")
            .eps("prop")
            .build()
            .unwrap();
        let parsed = parse_model("dadt(1) = -ka * a(1)\ncmt(2).alag = 0.5\n", &d).unwrap();
        assert!(matches!(
            parsed.body[0].kind,
            StmtKind::Assign {
                target: AssignTarget::Dadt(0),
                ..
            }
        ));
        assert!(matches!(
            parsed.body[1].kind,
            StmtKind::Assign {
                target: AssignTarget::DoseParam {
                    cmt: 1,
                    param: DoseParam::Alag
                },
                ..
            }
        ));
    }

    #[test]
    fn out_of_range_compartment_is_rejected() {
        let d = ModuleBuilder::ode(2)
            .theta("tvcl", 1.0)
            .eta("iiv_cl")
            .eps("prop")
            .build()
            .unwrap();
        let err = parse_model("dadt(3) = 1\n", &d).unwrap_err();
        assert!(err.message.contains("out of range"));
    }

    #[test]
    fn solve_expands_into_ordered_args_and_trigger() {
        let d = ModuleBuilder::closed_form(SolutionKind::EvOneCmtPhysio)
            .theta("tvcl", 4.0)
            .theta("tvv", 30.0)
            .theta("tvka", 1.0)
            .eta("iiv_cl")
            .eps("prop")
            .build()
            .unwrap();
        let src = "cl = tvcl * exp(iiv_cl)\nv = tvv\nka = tvka\nsln = solve(ev_one_cmt_physio, cl = cl, v = v, ka = ka)\nreturn prediction(sln.f * (1 + prop))\n";
        let parsed = parse_model(src, &d).unwrap();
        // cl, v, ka, then CL/V/KA/S2 args, Solve, return
        let kinds: Vec<String> = parsed
            .body
            .iter()
            .map(|s| crate::syntax::unparse::stmt_headline(s))
            .collect();
        assert!(kinds.contains(&"solve.CL = cl".to_string()));
        assert!(kinds.contains(&"solve.S2 = v".to_string()));
        assert!(kinds.contains(&"solve()".to_string()));
        let solve_pos = kinds.iter().position(|k| k == "solve()").unwrap();
        let arg_pos = kinds.iter().position(|k| k == "solve.CL = cl").unwrap();
        assert!(arg_pos < solve_pos);
        // The binder gives access to F.
        assert!(kinds
            .last()
            .unwrap()
            .contains("return prediction(__F__ * (1.0 + prop))"));
    }

    #[test]
    fn a_second_solve_is_rejected() {
        let d = ModuleBuilder::closed_form(SolutionKind::EvOneCmtMicro)
            .theta("tvk", 0.1)
            .theta("tvka", 1.0)
            .build()
            .unwrap();
        let src = "sln = solve(ev_one_cmt_micro, k = tvk, ka = tvka)\n\
                   two = solve(ev_one_cmt_micro, k = tvk, ka = tvka)\n\
                   return sln.f\n";
        let err = parse_model(src, &d).unwrap_err();
        assert_eq!(err.message, "Model already contains a solve() statement");
        assert_eq!(err.span.line, 2);

        // The first call needs no binder to arm the check.
        let src = "solve(ev_one_cmt_micro, k = tvk, ka = tvka)\n\
                   sln = solve(ev_one_cmt_micro, k = tvk, ka = tvka)\n\
                   return 1.0\n";
        let err = parse_model(src, &d).unwrap_err();
        assert_eq!(err.message, "Model already contains a solve() statement");
    }

    #[test]
    fn assigning_a_declared_symbol_is_rejected() {
        let d = pred_descriptor();
        let err = parse_model("tvcl = 2\n", &d).unwrap_err();
        assert!(err.message.contains("Cannot assign to declared symbol"));
    }

    #[test]
    fn keyword_arguments_parse() {
        let d = pred_descriptor();
        let parsed = parse_model("z = scale(wt, by = 70)\n", &d).unwrap();
        match &parsed.body[0].kind {
            StmtKind::Assign { value, .. } => match value {
                Expr::Call { name, args, kwargs } => {
                    assert_eq!(name, "scale");
                    assert_eq!(args.len(), 1);
                    assert_eq!(kwargs[0].0, "by");
                }
                other => panic!("expected call, got {:?}", other),
            },
            other => panic!("expected assign, got {:?}", other),
        }
    }

    #[test]
    fn unparse_of_parse_reparses_identically() {
        let d = pred_descriptor();
        let src = "cl = tvcl * exp(iiv_cl)\nv = tvv\nif (wt > 70) {\n    cl = cl * 1.2\n}\nreturn prediction(cl / v)\n";
        let first = parse_model(src, &d).unwrap();
        let printed = crate::syntax::unparse::unparse(&first.body);
        let second = parse_model(&printed, &d).unwrap();
        let strip = |b: &Block| -> Vec<StmtKind> {
            fn go(b: &Block, out: &mut Vec<StmtKind>) {
                for s in b {
                    out.push(s.kind.clone());
                }
            }
            let mut out = Vec::new();
            go(b, &mut out);
            out
        };
        assert_eq!(strip(&first.body), strip(&second.body));
    }
}
