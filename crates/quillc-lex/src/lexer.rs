//! Main lexer implementation for the Quill language.
//!
//! The lexer produces tokens on demand. Whitespace (newlines included) and
//! `//` line comments are skipped between tokens. Each token owns a copy of
//! its lexeme and records the line it started on.

use crate::cursor::Cursor;
use crate::token::{keyword_from_ident, Token, TokenKind};

/// The Quill lexer.
///
/// # Example
///
/// ```
/// use quillc_lex::{Lexer, TokenKind};
///
/// let mut lexer = Lexer::new("1 + 2");
/// assert_eq!(lexer.next_token().kind, TokenKind::Number);
/// assert_eq!(lexer.next_token().kind, TokenKind::Plus);
/// assert_eq!(lexer.next_token().kind, TokenKind::Number);
/// assert_eq!(lexer.next_token().kind, TokenKind::Eof);
/// ```
pub struct Lexer<'a> {
    cursor: Cursor<'a>,

    /// Byte offset where the current token started.
    token_start: usize,

    /// Line where the current token started.
    token_line: u32,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer over `source`.
    pub fn new(source: &'a str) -> Self {
        Self {
            cursor: Cursor::new(source),
            token_start: 0,
            token_line: 1,
        }
    }

    /// Returns the next token, or a [`TokenKind::Eof`] token at the end of
    /// the input. Lexical errors are reported in-band as
    /// [`TokenKind::Error`] tokens whose lexeme is the message.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        self.token_start = self.cursor.position();
        self.token_line = self.cursor.line();

        if self.cursor.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let byte = self.cursor.advance();

        if byte.is_ascii_alphabetic() || byte == b'_' {
            return self.identifier();
        }
        if byte.is_ascii_digit() {
            return self.number();
        }

        match byte {
            b'(' => self.make_token(TokenKind::LParen),
            b')' => self.make_token(TokenKind::RParen),
            b'{' => self.make_token(TokenKind::LBrace),
            b'}' => self.make_token(TokenKind::RBrace),
            b'[' => self.make_token(TokenKind::LBracket),
            b']' => self.make_token(TokenKind::RBracket),
            b',' => self.make_token(TokenKind::Comma),
            b';' => self.make_token(TokenKind::Semicolon),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'*' => self.make_token(TokenKind::Star),
            b'/' => self.make_token(TokenKind::Slash),
            b'+' => {
                let kind = if self.cursor.matches(b'=') {
                    TokenKind::PlusEqual
                } else {
                    TokenKind::Plus
                };
                self.make_token(kind)
            }
            b'!' => {
                let kind = if self.cursor.matches(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.cursor.matches(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.cursor.matches(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.cursor.matches(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character"),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.cursor.peek() {
                b' ' | b'\r' | b'\t' | b'\n' => {
                    self.cursor.advance();
                }
                b'/' if self.cursor.peek_next() == b'/' => {
                    while self.cursor.peek() != b'\n' && !self.cursor.is_at_end() {
                        self.cursor.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token {
        while self.cursor.peek().is_ascii_alphanumeric() || self.cursor.peek() == b'_' {
            self.cursor.advance();
        }
        let lexeme = self.cursor.slice_from(self.token_start);
        let kind = keyword_from_ident(lexeme).unwrap_or(TokenKind::Identifier);
        Token::new(kind, lexeme, self.token_line)
    }

    fn number(&mut self) -> Token {
        while self.cursor.peek().is_ascii_digit() {
            self.cursor.advance();
        }
        if self.cursor.peek() == b'.' && self.cursor.peek_next().is_ascii_digit() {
            self.cursor.advance();
            while self.cursor.peek().is_ascii_digit() {
                self.cursor.advance();
            }
        }
        let mut token = self.make_token(TokenKind::Number);
        // The grammar only admits lexemes that parse as f64.
        token.number = token.lexeme.parse().unwrap_or(0.0);
        token
    }

    fn string(&mut self) -> Token {
        while self.cursor.peek() != b'"' && self.cursor.peek() != b'\n' && !self.cursor.is_at_end()
        {
            self.cursor.advance();
        }
        if self.cursor.peek() != b'"' {
            return self.error_token("Unterminated string literal");
        }
        self.cursor.advance(); // Closing quote.

        // The stored lexeme is the content with the quotes stripped.
        let full = self.cursor.slice_from(self.token_start);
        let content = &full[1..full.len() - 1];
        Token::new(TokenKind::Str, content, self.token_line)
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.cursor.slice_from(self.token_start), self.token_line)
    }

    fn error_token(&self, message: &str) -> Token {
        Token::new(TokenKind::Error, message, self.token_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            kinds.push(token.kind);
        }
        kinds
    }

    #[test]
    fn lexes_declaration() {
        assert_eq!(
            lex_kinds("let x = 42;"),
            vec![
                TokenKind::Let,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn lexes_two_character_operators() {
        assert_eq!(
            lex_kinds("== != <= >= += = ! < >"),
            vec![
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::PlusEqual,
                TokenKind::Equal,
                TokenKind::Bang,
                TokenKind::Less,
                TokenKind::Greater,
            ]
        );
    }

    #[test]
    fn number_token_carries_value() {
        let mut lexer = Lexer::new("3.25");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Number);
        assert_eq!(token.lexeme, "3.25");
        assert_eq!(token.number, 3.25);
    }

    #[test]
    fn dot_without_digits_is_not_part_of_number() {
        assert_eq!(
            lex_kinds("1.x"),
            vec![TokenKind::Number, TokenKind::Dot, TokenKind::Identifier]
        );
    }

    #[test]
    fn string_lexeme_strips_quotes() {
        let mut lexer = Lexer::new("\"hello\"");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Str);
        assert_eq!(token.lexeme, "hello");
    }

    #[test]
    fn unterminated_string_is_error() {
        let mut lexer = Lexer::new("\"abc");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string literal");
    }

    #[test]
    fn newline_in_string_is_error() {
        let mut lexer = Lexer::new("\"ab\ncd\"");
        assert_eq!(lexer.next_token().kind, TokenKind::Error);
    }

    #[test]
    fn skips_comments() {
        assert_eq!(
            lex_kinds("// a comment\n1 // trailing\n"),
            vec![TokenKind::Number]
        );
    }

    #[test]
    fn tracks_token_lines() {
        let mut lexer = Lexer::new("1\n2\n\n3");
        assert_eq!(lexer.next_token().line, 1);
        assert_eq!(lexer.next_token().line, 2);
        assert_eq!(lexer.next_token().line, 4);
    }

    #[test]
    fn class_keywords() {
        assert_eq!(
            lex_kinds("class Point { constructor(x) { this.x = x; } }"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::LBrace,
                TokenKind::Constructor,
                TokenKind::LParen,
                TokenKind::Identifier,
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::This,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::RBrace,
                TokenKind::RBrace,
            ]
        );
    }
}
