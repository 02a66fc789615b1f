//! Expression parsing.
//!
//! Precedence, lowest to highest: assignment (right-associative) →
//! equality → comparison → term → factor → unary → call/index/property →
//! primary. Each level is one function; binary levels loop on their
//! operators, so they are left-associative.

use quillc_lex::TokenKind;

use crate::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use crate::Parser;

impl<'a> Parser<'a> {
    pub(crate) fn expression(&mut self) -> Option<Expr> {
        self.assignment()
    }

    /// Assignment accepts exactly two l-value shapes: an identifier
    /// (`x = e`, `x += e`) and a property (`obj.name = e`). A get-property
    /// node on the left of `=` is rewritten into a set-property node;
    /// everything else is an invalid assignment target.
    fn assignment(&mut self) -> Option<Expr> {
        let target = self.equality()?;

        if self.matches(TokenKind::Equal) {
            let value = Box::new(self.assignment()?);
            let line = target.line;
            return match target.kind {
                ExprKind::Identifier(name) => Some(Expr {
                    kind: ExprKind::Assign { name, value },
                    line,
                }),
                ExprKind::GetProperty { object, name } => Some(Expr {
                    kind: ExprKind::SetProperty {
                        object,
                        name,
                        value,
                    },
                    line,
                }),
                _ => {
                    self.error("Invalid assignment target.");
                    None
                }
            };
        }

        if self.matches(TokenKind::PlusEqual) {
            let value = self.assignment()?;
            let line = target.line;
            return match target.kind {
                // `x += e` desugars to `x = x + e` with a duplicated
                // identifier node.
                ExprKind::Identifier(name) => {
                    let read = Expr {
                        kind: ExprKind::Identifier(name.clone()),
                        line,
                    };
                    let sum = Expr {
                        kind: ExprKind::Binary {
                            left: Box::new(read),
                            op: BinaryOp::Add,
                            right: Box::new(value),
                        },
                        line,
                    };
                    Some(Expr {
                        kind: ExprKind::Assign {
                            name,
                            value: Box::new(sum),
                        },
                        line,
                    })
                }
                _ => {
                    self.error("Invalid assignment target.");
                    None
                }
            };
        }

        Some(target)
    }

    fn equality(&mut self) -> Option<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = if self.matches(TokenKind::EqualEqual) {
                BinaryOp::Equal
            } else if self.matches(TokenKind::BangEqual) {
                BinaryOp::NotEqual
            } else {
                break;
            };
            let right = self.comparison()?;
            expr = binary(expr, op, right);
        }
        Some(expr)
    }

    fn comparison(&mut self) -> Option<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = if self.matches(TokenKind::Greater) {
                BinaryOp::Greater
            } else if self.matches(TokenKind::GreaterEqual) {
                BinaryOp::GreaterEqual
            } else if self.matches(TokenKind::Less) {
                BinaryOp::Less
            } else if self.matches(TokenKind::LessEqual) {
                BinaryOp::LessEqual
            } else {
                break;
            };
            let right = self.term()?;
            expr = binary(expr, op, right);
        }
        Some(expr)
    }

    fn term(&mut self) -> Option<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = if self.matches(TokenKind::Plus) {
                BinaryOp::Add
            } else if self.matches(TokenKind::Minus) {
                BinaryOp::Subtract
            } else {
                break;
            };
            let right = self.factor()?;
            expr = binary(expr, op, right);
        }
        Some(expr)
    }

    fn factor(&mut self) -> Option<Expr> {
        let mut expr = self.unary()?;
        loop {
            let op = if self.matches(TokenKind::Star) {
                BinaryOp::Multiply
            } else if self.matches(TokenKind::Slash) {
                BinaryOp::Divide
            } else {
                break;
            };
            let right = self.unary()?;
            expr = binary(expr, op, right);
        }
        Some(expr)
    }

    fn unary(&mut self) -> Option<Expr> {
        let op = if self.matches(TokenKind::Bang) {
            UnaryOp::Not
        } else if self.matches(TokenKind::Minus) {
            UnaryOp::Negate
        } else {
            return self.postfix();
        };
        let line = self.previous.line;
        let right = self.unary()?;
        Some(Expr {
            kind: ExprKind::Unary {
                op,
                right: Box::new(right),
            },
            line,
        })
    }

    /// Postfix chaining: after a primary, loop over `(args)`, `[index]`,
    /// `.name`, and `.name(args)`.
    fn postfix(&mut self) -> Option<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.matches(TokenKind::LParen) {
                let arguments = self.argument_list()?;
                let line = expr.line;
                expr = Expr {
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        arguments,
                    },
                    line,
                };
            } else if self.matches(TokenKind::LBracket) {
                let index = self.expression()?;
                if !self.consume(TokenKind::RBracket, "Expect ']' after index.") {
                    return None;
                }
                let line = expr.line;
                expr = Expr {
                    kind: ExprKind::Index {
                        array: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                };
            } else if self.matches(TokenKind::Dot) {
                if !self.consume(TokenKind::Identifier, "Expect property name after '.'.") {
                    return None;
                }
                let name = self.previous.lexeme.clone();
                let line = expr.line;
                if self.matches(TokenKind::LParen) {
                    let arguments = self.argument_list()?;
                    expr = Expr {
                        kind: ExprKind::Invoke {
                            object: Box::new(expr),
                            name,
                            arguments,
                        },
                        line,
                    };
                } else {
                    expr = Expr {
                        kind: ExprKind::GetProperty {
                            object: Box::new(expr),
                            name,
                        },
                        line,
                    };
                }
            } else {
                break;
            }
        }
        Some(expr)
    }

    /// Parses `expr (, expr)*` up to and including the closing paren. The
    /// opening paren has already been consumed.
    fn argument_list(&mut self) -> Option<Vec<Expr>> {
        let mut arguments = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                arguments.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        if !self.consume(TokenKind::RParen, "Expect ')' after arguments.") {
            return None;
        }
        Some(arguments)
    }

    fn primary(&mut self) -> Option<Expr> {
        let line = self.current.line;

        if self.matches(TokenKind::True) {
            return Some(Expr {
                kind: ExprKind::Bool(true),
                line,
            });
        }
        if self.matches(TokenKind::False) {
            return Some(Expr {
                kind: ExprKind::Bool(false),
                line,
            });
        }
        if self.matches(TokenKind::Null) {
            return Some(Expr {
                kind: ExprKind::Null,
                line,
            });
        }
        if self.matches(TokenKind::This) {
            return Some(Expr {
                kind: ExprKind::This,
                line,
            });
        }
        if self.matches(TokenKind::Number) {
            return Some(Expr {
                kind: ExprKind::Number(self.previous.number),
                line,
            });
        }
        if self.matches(TokenKind::Str) {
            return Some(Expr {
                kind: ExprKind::Str(self.previous.lexeme.clone()),
                line,
            });
        }
        if self.matches(TokenKind::Identifier) {
            return Some(Expr {
                kind: ExprKind::Identifier(self.previous.lexeme.clone()),
                line,
            });
        }
        if self.matches(TokenKind::LParen) {
            let expr = self.expression()?;
            if !self.consume(TokenKind::RParen, "Expect ')' after expression.") {
                return None;
            }
            return Some(expr);
        }
        if self.matches(TokenKind::LBracket) {
            let mut elements = Vec::new();
            if !self.check(TokenKind::RBracket) {
                loop {
                    elements.push(self.expression()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            if !self.consume(TokenKind::RBracket, "Expect ']' after array elements.") {
                return None;
            }
            return Some(Expr {
                kind: ExprKind::Array(elements),
                line,
            });
        }

        self.error("Expect expression.");
        None
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    let line = left.line;
    Expr {
        kind: ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
        line,
    }
}
