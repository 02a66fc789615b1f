//! Edge case tests for quillc-lex.

#[cfg(test)]
mod tests {
    use crate::{Lexer, Token, TokenKind};
    use proptest::prelude::*;

    fn lex_all(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn edge_empty_source() {
        assert!(lex_all("").is_empty());
    }

    #[test]
    fn edge_whitespace_only() {
        assert!(lex_all("  \t\r\n\n ").is_empty());
    }

    #[test]
    fn edge_comment_only() {
        assert!(lex_all("// nothing here").is_empty());
    }

    #[test]
    fn edge_comment_at_eof_without_newline() {
        assert_eq!(lex_all("1 //").len(), 1);
    }

    #[test]
    fn edge_single_char_identifier() {
        let tokens = lex_all("x");
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].lexeme, "x");
    }

    #[test]
    fn edge_underscore_identifiers() {
        let tokens = lex_all("_ _x x_1");
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Identifier));
    }

    #[test]
    fn edge_long_identifier() {
        let name = "a".repeat(10_000);
        let tokens = lex_all(&name);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].lexeme, name);
    }

    #[test]
    fn edge_keyword_prefix_is_identifier() {
        let tokens = lex_all("letter whiles classy");
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Identifier));
    }

    #[test]
    fn edge_empty_string_literal() {
        let tokens = lex_all("\"\"");
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, "");
    }

    #[test]
    fn edge_adjacent_operators() {
        // `===` lexes as `==` then `=` (maximal munch).
        let kinds: Vec<_> = lex_all("===").iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::EqualEqual, TokenKind::Equal]);
    }

    #[test]
    fn edge_minus_has_no_compound_form() {
        let kinds: Vec<_> = lex_all("-=").iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Minus, TokenKind::Equal]);
    }

    #[test]
    fn edge_unexpected_character() {
        let tokens = lex_all("@");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unexpected character");
    }

    #[test]
    fn edge_lexer_continues_after_error_token() {
        let tokens = lex_all("@ 1");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[1].kind, TokenKind::Number);
    }

    #[test]
    fn edge_number_without_fraction_keeps_dot_separate() {
        let kinds: Vec<_> = lex_all("1.").iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Number, TokenKind::Dot]);
    }

    proptest! {
        /// Lexing arbitrary input terminates and never panics.
        #[test]
        fn lexing_never_panics(source in ".{0,256}") {
            let _ = lex_all(&source);
        }

        /// Any ASCII identifier lexes to a single token with the same text.
        #[test]
        fn identifiers_round_trip(name in "[a-zA-Z_][a-zA-Z0-9_]{0,32}") {
            prop_assume!(crate::token::keyword_from_ident(&name).is_none());
            let tokens = lex_all(&name);
            prop_assert_eq!(tokens.len(), 1);
            prop_assert_eq!(tokens[0].kind, TokenKind::Identifier);
            prop_assert_eq!(&tokens[0].lexeme, &name);
        }
    }
}
