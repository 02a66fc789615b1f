//! Edge case tests for quillc-par.

#[cfg(test)]
mod tests {
    use crate::ast::{BinaryOp, Expr, ExprKind, Stmt, StmtKind, UnaryOp};
    use crate::parse;

    fn parse_one(source: &str) -> Stmt {
        let mut program = parse(source).expect("source should parse");
        assert_eq!(program.statements.len(), 1, "expected one statement");
        program.statements.remove(0)
    }

    fn parse_expr(source: &str) -> Expr {
        match parse_one(source).kind {
            StmtKind::Expression(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = parse_expr("1 + 2 * 3;");
        match expr.kind {
            ExprKind::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(
                    right.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Multiply,
                        ..
                    }
                ));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn subtraction_is_left_associative() {
        let expr = parse_expr("1 - 2 - 3;");
        match expr.kind {
            ExprKind::Binary { op, left, .. } => {
                assert_eq!(op, BinaryOp::Subtract);
                assert!(matches!(
                    left.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Subtract,
                        ..
                    }
                ));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn assignment_is_right_associative() {
        let expr = parse_expr("a = b = 1;");
        match expr.kind {
            ExprKind::Assign { name, value } => {
                assert_eq!(name, "a");
                assert!(matches!(value.kind, ExprKind::Assign { .. }));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn unary_chains_nest() {
        let expr = parse_expr("!!x;");
        match expr.kind {
            ExprKind::Unary { op, right } => {
                assert_eq!(op, UnaryOp::Not);
                assert!(matches!(
                    right.kind,
                    ExprKind::Unary {
                        op: UnaryOp::Not,
                        ..
                    }
                ));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn plus_equal_desugars_to_read_add_assign() {
        let expr = parse_expr("x += 2;");
        match expr.kind {
            ExprKind::Assign { name, value } => {
                assert_eq!(name, "x");
                match value.kind {
                    ExprKind::Binary { left, op, .. } => {
                        assert_eq!(op, BinaryOp::Add);
                        assert_eq!(left.kind, ExprKind::Identifier("x".to_string()));
                    }
                    other => panic!("unexpected desugaring: {other:?}"),
                }
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn property_write_rewrites_get_into_set() {
        let expr = parse_expr("p.x = 1;");
        assert!(matches!(expr.kind, ExprKind::SetProperty { .. }));
    }

    #[test]
    fn plus_equal_on_property_is_invalid_target() {
        let error = parse("p.x += 1;").unwrap_err();
        assert_eq!(error.message, "Invalid assignment target.");
    }

    #[test]
    fn literal_assignment_target_is_invalid() {
        let error = parse("1 = 2;").unwrap_err();
        assert_eq!(error.message, "Invalid assignment target.");
    }

    #[test]
    fn postfix_chain_builds_nested_nodes() {
        let expr = parse_expr("a.b.c(1)[0];");
        match expr.kind {
            ExprKind::Index { array, .. } => match array.kind {
                ExprKind::Invoke { object, name, arguments } => {
                    assert_eq!(name, "c");
                    assert_eq!(arguments.len(), 1);
                    assert!(matches!(object.kind, ExprKind::GetProperty { .. }));
                }
                other => panic!("unexpected shape: {other:?}"),
            },
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn call_of_property_value_is_invoke_not_call() {
        // `a.b(1)` fuses into an invoke node; `(a.b)(1)` stays a call.
        assert!(matches!(
            parse_expr("a.b(1);").kind,
            ExprKind::Invoke { .. }
        ));
        assert!(matches!(parse_expr("(a.b)(1);").kind, ExprKind::Call { .. }));
    }

    #[test]
    fn empty_and_nested_array_literals() {
        assert!(matches!(parse_expr("[];").kind, ExprKind::Array(ref e) if e.is_empty()));
        match parse_expr("[1, [2, 3]];").kind {
            ExprKind::Array(elements) => {
                assert_eq!(elements.len(), 2);
                assert!(matches!(elements[1].kind, ExprKind::Array(_)));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn class_with_constructor_and_methods() {
        let stmt = parse_one(
            "class Point { constructor(x) { this.x = x; } get() { return this.x; } }",
        );
        match stmt.kind {
            StmtKind::Class(class) => {
                assert_eq!(class.name, "Point");
                assert_eq!(class.methods.len(), 2);
                assert!(class.methods[0].is_constructor);
                assert_eq!(class.methods[0].name, "constructor");
                assert!(!class.methods[1].is_constructor);
                assert_eq!(class.methods[1].name, "get");
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn dangling_else_binds_to_nearest_if() {
        let stmt = parse_one("if (a) if (b) 1; else 2;");
        match stmt.kind {
            StmtKind::If { else_branch, then_branch, .. } => {
                assert!(else_branch.is_none());
                assert!(matches!(
                    then_branch.kind,
                    StmtKind::If {
                        else_branch: Some(_),
                        ..
                    }
                ));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn return_without_value() {
        let program = parse("function f() { return; }").unwrap();
        match &program.statements[0].kind {
            StmtKind::Function(decl) => {
                assert!(matches!(decl.body[0].kind, StmtKind::Return(None)));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn first_error_wins() {
        let error = parse("let 1 = 2; let 3 = 4;").unwrap_err();
        assert_eq!(error.message, "Expect variable name.");
    }

    #[test]
    fn missing_semicolon_is_reported() {
        let error = parse("1 + 2").unwrap_err();
        assert_eq!(error.message, "Expect ';' after expression.");
    }

    #[test]
    fn lexical_error_surfaces_with_line() {
        let error = parse("let x = 1;\nlet y = @;").unwrap_err();
        assert_eq!(error.message, "Unexpected character");
        assert_eq!(error.line, 2);
    }

    #[test]
    fn error_inside_block_does_not_hang() {
        assert!(parse("{ 1; @ }").is_err());
        assert!(parse("function f() { let = ; }").is_err());
    }

    #[test]
    fn statement_lines_are_recorded() {
        let program = parse("let a = 1;\nlet b = 2;").unwrap();
        assert_eq!(program.statements[0].line, 1);
        assert_eq!(program.statements[1].line, 2);
    }

    #[test]
    fn this_is_a_primary_expression() {
        assert!(matches!(parse_expr("this;").kind, ExprKind::This));
    }

    #[test]
    fn grouping_overrides_precedence() {
        let expr = parse_expr("(1 + 2) * 3;");
        assert!(matches!(
            expr.kind,
            ExprKind::Binary {
                op: BinaryOp::Multiply,
                ..
            }
        ));
    }
}
