//! Declaration and statement parsing.

use quillc_lex::TokenKind;

use crate::ast::{ClassDecl, ClassMethod, FunctionDecl, Stmt, StmtKind};
use crate::Parser;

impl<'a> Parser<'a> {
    pub(crate) fn declaration(&mut self) -> Option<Stmt> {
        if self.matches(TokenKind::Function) {
            return self.function_declaration();
        }
        if self.matches(TokenKind::Class) {
            return self.class_declaration();
        }
        if self.matches(TokenKind::Let) {
            return self.let_declaration();
        }
        self.statement()
    }

    fn statement(&mut self) -> Option<Stmt> {
        if self.matches(TokenKind::If) {
            return self.if_statement();
        }
        if self.matches(TokenKind::While) {
            return self.while_statement();
        }
        if self.matches(TokenKind::Return) {
            return self.return_statement();
        }
        if self.matches(TokenKind::LBrace) {
            let line = self.previous.line;
            let statements = self.block()?;
            return Some(Stmt {
                kind: StmtKind::Block(statements),
                line,
            });
        }
        self.expression_statement()
    }

    fn expression_statement(&mut self) -> Option<Stmt> {
        let expression = self.expression()?;
        if !self.consume(TokenKind::Semicolon, "Expect ';' after expression.") {
            return None;
        }
        let line = expression.line;
        Some(Stmt {
            kind: StmtKind::Expression(expression),
            line,
        })
    }

    fn let_declaration(&mut self) -> Option<Stmt> {
        let line = self.previous.line;
        if !self.consume(TokenKind::Identifier, "Expect variable name.") {
            return None;
        }
        let name = self.previous.lexeme.clone();

        let initializer = if self.matches(TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };

        if !self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.") {
            return None;
        }
        Some(Stmt {
            kind: StmtKind::Let { name, initializer },
            line,
        })
    }

    fn if_statement(&mut self) -> Option<Stmt> {
        let line = self.previous.line;
        if !self.consume(TokenKind::LParen, "Expect '(' after 'if'.") {
            return None;
        }
        let condition = self.expression()?;
        if !self.consume(TokenKind::RParen, "Expect ')' after condition.") {
            return None;
        }

        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.matches(TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };

        Some(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            line,
        })
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        let line = self.previous.line;
        if !self.consume(TokenKind::LParen, "Expect '(' after 'while'.") {
            return None;
        }
        let condition = self.expression()?;
        if !self.consume(TokenKind::RParen, "Expect ')' after condition.") {
            return None;
        }
        let body = Box::new(self.statement()?);

        Some(Stmt {
            kind: StmtKind::While { condition, body },
            line,
        })
    }

    fn return_statement(&mut self) -> Option<Stmt> {
        let line = self.previous.line;
        let value = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        if !self.consume(TokenKind::Semicolon, "Expect ';' after return statement.") {
            return None;
        }
        Some(Stmt {
            kind: StmtKind::Return(value),
            line,
        })
    }

    /// Parses the statements of a block. The opening brace has been
    /// consumed; this consumes through the closing brace. A failed
    /// statement triggers synchronization so one bad statement does not
    /// swallow the closing brace, but a stalled recovery abandons the
    /// block.
    pub(crate) fn block(&mut self) -> Option<Vec<Stmt>> {
        let mut statements = Vec::new();

        while !self.check(TokenKind::RBrace) && self.current.kind != TokenKind::Eof {
            let before = self.tokens_consumed();
            match self.declaration() {
                Some(stmt) => statements.push(stmt),
                None => {
                    self.synchronize();
                    if self.check(TokenKind::RBrace) {
                        break;
                    }
                    if self.tokens_consumed() == before {
                        return None;
                    }
                }
            }
        }

        if !self.consume(TokenKind::RBrace, "Expect '}' after block.") {
            return None;
        }
        Some(statements)
    }

    fn function_declaration(&mut self) -> Option<Stmt> {
        let line = self.previous.line;
        if !self.consume(TokenKind::Identifier, "Expect function name.") {
            return None;
        }
        let name = self.previous.lexeme.clone();

        if !self.consume(TokenKind::LParen, "Expect '(' after function name.") {
            return None;
        }
        let parameters = self.parameter_list()?;
        if !self.consume(TokenKind::LBrace, "Expect '{' before function body.") {
            return None;
        }
        let body = self.block()?;

        Some(Stmt {
            kind: StmtKind::Function(FunctionDecl {
                name,
                parameters,
                body,
            }),
            line,
        })
    }

    fn class_declaration(&mut self) -> Option<Stmt> {
        let line = self.previous.line;
        if !self.consume(TokenKind::Identifier, "Expect class name.") {
            return None;
        }
        let name = self.previous.lexeme.clone();

        if !self.consume(TokenKind::LBrace, "Expect '{' before class body.") {
            return None;
        }

        let mut methods = Vec::new();
        while !self.check(TokenKind::RBrace) && self.current.kind != TokenKind::Eof {
            methods.push(self.class_method()?);
        }

        if !self.consume(TokenKind::RBrace, "Expect '}' after class body.") {
            return None;
        }

        Some(Stmt {
            kind: StmtKind::Class(ClassDecl { name, methods }),
            line,
        })
    }

    fn class_method(&mut self) -> Option<ClassMethod> {
        let is_constructor = if self.matches(TokenKind::Constructor) {
            true
        } else if self.matches(TokenKind::Identifier) {
            false
        } else {
            self.error("Expect method name.");
            return None;
        };
        let name = self.previous.lexeme.clone();
        let line = self.previous.line;

        if !self.consume(TokenKind::LParen, "Expect '(' after method name.") {
            return None;
        }
        let parameters = self.parameter_list()?;
        if !self.consume(TokenKind::LBrace, "Expect '{' before method body.") {
            return None;
        }
        let body = self.block()?;

        Some(ClassMethod {
            name,
            is_constructor,
            parameters,
            body,
            line,
        })
    }

    /// Parses `name (, name)*` up to and including the closing paren. The
    /// opening paren has already been consumed.
    fn parameter_list(&mut self) -> Option<Vec<String>> {
        let mut parameters = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                if !self.consume(TokenKind::Identifier, "Expect parameter name.") {
                    return None;
                }
                parameters.push(self.previous.lexeme.clone());
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        if !self.consume(TokenKind::RParen, "Expect ')' after parameters.") {
            return None;
        }
        Some(parameters)
    }
}
