//! Source locations for model statements.
//!
//! Spans are attached to statements (not expressions) and drive both the
//! caret excerpts in error output and the source-echo comments in the
//! generated unit.

use std::fmt;

/// A half-open region of the model source, tracked as line/column plus length.
///
/// Lines and columns are 1-based; a zeroed span means "no location" (e.g. a
/// statement synthesized by a transform with no single source anchor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
    pub len: u32,
}

impl Span {
    pub fn new(line: u32, col: u32, len: u32) -> Self {
        Span { line, col, len }
    }

    /// True when this span carries no real location.
    pub fn is_synthetic(&self) -> bool {
        self.line == 0
    }

    /// Render a caret excerpt for this span against the original source.
    ///
    /// ```text
    ///  --> model:4:9
    ///   |
    /// 4 |     k = cl / v
    ///   |         ^^
    /// ```
    pub fn excerpt(&self, source: &str) -> String {
        if self.is_synthetic() {
            return String::new();
        }
        let line_txt = match source.lines().nth(self.line as usize - 1) {
            Some(l) => l,
            None => return String::new(),
        };
        let lineno = self.line.to_string();
        let gutter = " ".repeat(lineno.len());
        let pad = " ".repeat(self.col.saturating_sub(1) as usize);
        let carets = "^".repeat(self.len.max(1) as usize);
        format!(
            " --> model:{}:{}\n{} |\n{} | {}\n{} | {}{}",
            self.line, self.col, gutter, lineno, line_txt, gutter, pad, carets
        )
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "<generated>")
        } else {
            write!(f, "{}:{}", self.line, self.col)
        }
    }
}
