//! quillc-par - Recursive-descent parser for the Quill language.
//!
//! Builds an owned [`ast::Program`] from source text. Parsing is
//! single-pass over the token stream with one token of lookahead. On a
//! syntax error the parser records the first diagnostic, sets a sticky
//! error flag that suppresses cascaded reports, and synchronizes at the
//! next statement boundary before giving up.
//!
//! # Example
//!
//! ```
//! let program = quillc_par::parse("let x = 1; x + 2;").unwrap();
//! assert_eq!(program.statements.len(), 2);
//! ```

pub mod ast;

mod expr;
mod stmt;

mod edge_cases;

use quillc_lex::{Lexer, Token, TokenKind};
use thiserror::Error;

use ast::Program;

/// A parse diagnostic: the first error encountered, with its source line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[line {line}] {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

/// Parses `source` into a program, or returns the first syntax error.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let mut parser = Parser::new(source);

    let mut statements = Vec::new();
    while parser.current.kind != TokenKind::Eof && !parser.had_error {
        match parser.declaration() {
            Some(stmt) => statements.push(stmt),
            None => parser.synchronize(),
        }
    }

    match parser.error.take() {
        Some(error) => Err(error),
        None => Ok(Program { statements }),
    }
}

/// Parser state: the lexer, one token of lookahead, and the sticky error.
pub(crate) struct Parser<'a> {
    lexer: Lexer<'a>,
    pub(crate) current: Token,
    pub(crate) previous: Token,
    pub(crate) had_error: bool,
    error: Option<ParseError>,

    /// Tokens consumed so far; used to detect a stalled recovery.
    consumed: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token();
        let mut parser = Self {
            lexer,
            current,
            previous: Token::new(TokenKind::Error, "", 0),
            had_error: false,
            error: None,
            consumed: 0,
        };
        if parser.current.kind == TokenKind::Error {
            let message = parser.current.lexeme.clone();
            parser.report(parser.current.line, message);
        }
        parser
    }

    /// Records a diagnostic at the current token. Only the first error per
    /// parse is kept; later ones are dropped.
    pub(crate) fn error(&mut self, message: impl Into<String>) {
        self.report(self.current.line, message.into());
    }

    fn report(&mut self, line: u32, message: String) {
        if self.had_error {
            return;
        }
        self.had_error = true;
        self.error = Some(ParseError { line, message });
    }

    pub(crate) fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, self.lexer.next_token());
        self.consumed += 1;
        if self.current.kind == TokenKind::Error {
            let message = self.current.lexeme.clone();
            self.report(self.current.line, message);
        }
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub(crate) fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    /// Consumes a token of the given kind or records `message`.
    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        self.error(message);
        false
    }

    /// Panic-mode recovery: skip forward until just past a semicolon or to
    /// a token that opens a declaration.
    pub(crate) fn synchronize(&mut self) {
        if !self.had_error {
            return;
        }
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Function
                | TokenKind::Class
                | TokenKind::Let
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    pub(crate) fn tokens_consumed(&self) -> usize {
        self.consumed
    }
}
