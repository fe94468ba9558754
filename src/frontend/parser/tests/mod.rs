use super::ast::{BinaryOp, Expr, LetInit, Stmt};
use super::{parse_program, ParseError};
use crate::frontend::lexer::tokenize;

fn parse(source: &str) -> super::ast::Program {
    parse_program(tokenize(source).expect("tokenizes")).expect("parses")
}

fn parse_err(source: &str) -> ParseError {
    parse_program(tokenize(source).expect("tokenizes")).expect_err("should fail to parse")
}

#[test]
fn parses_function_and_params() {
    let program = parse("fn add(a, b) { return a + b; }");
    assert_eq!(program.functions.len(), 1);
    let f = &program.functions[0];
    assert_eq!(f.name, "add");
    assert_eq!(f.params, vec!["a", "b"]);
    assert_eq!(f.body.len(), 1);
    assert!(matches!(f.body[0], Stmt::Return { .. }));
}

#[test]
fn parses_class_with_attributes_and_methods() {
    let program = parse(
        r#"
        class Point extends Base {
            x = 0;
            y = 0;
            fn __new__(self, a, b) { self.x = a; self.y = b; }
            fn sum(self) { return self.x + self.y; }
        }
        "#,
    );
    assert_eq!(program.classes.len(), 1);
    let class = &program.classes[0];
    assert_eq!(class.name, "Point");
    assert_eq!(class.base_name.as_deref(), Some("Base"));
    assert_eq!(class.attributes.len(), 2);
    assert_eq!(class.methods.len(), 2);
    assert_eq!(class.methods[0].name, "__new__");
}

#[test]
fn precedence_multiplication_binds_tighter() {
    let program = parse("fn f() { return 1 + 2 * 3; }");
    let Stmt::Return { expr, .. } = &program.functions[0].body[0] else {
        panic!("expected return");
    };
    let Expr::Binary {
        op: BinaryOp::Add,
        right,
        ..
    } = expr
    else {
        panic!("expected top-level add, got {:?}", expr);
    };
    assert!(matches!(
        **right,
        Expr::Binary {
            op: BinaryOp::Mul,
            ..
        }
    ));
}

#[test]
fn comparison_binds_tighter_than_equality() {
    let program = parse("fn f() { return 1 < 2 == 3 < 4; }");
    let Stmt::Return { expr, .. } = &program.functions[0].body[0] else {
        panic!("expected return");
    };
    assert!(matches!(
        expr,
        Expr::Binary {
            op: BinaryOp::Equal,
            ..
        }
    ));
}

#[test]
fn unary_minus_lowers_to_zero_minus() {
    let program = parse("fn f() { return -x; }");
    let Stmt::Return { expr, .. } = &program.functions[0].body[0] else {
        panic!("expected return");
    };
    let Expr::Binary {
        op: BinaryOp::Sub,
        left,
        ..
    } = expr
    else {
        panic!("expected subtraction, got {:?}", expr);
    };
    assert!(matches!(**left, Expr::Number { value: 0, .. }));
}

#[test]
fn postfix_chain_call_property_index() {
    let program = parse("fn f() { return a.b(1).c[2]; }");
    let Stmt::Return { expr, .. } = &program.functions[0].body[0] else {
        panic!("expected return");
    };
    let Expr::Index { object, .. } = expr else {
        panic!("expected index, got {:?}", expr);
    };
    let Expr::Property { object, .. } = &**object else {
        panic!("expected property");
    };
    assert!(matches!(**object, Expr::MethodCall { .. }));
}

#[test]
fn for_range_single_argument_desugars_from_zero() {
    let program = parse("fn f() { for (i in range(10)) { i; } }");
    let Stmt::ForRange { start, end, .. } = &program.functions[0].body[0] else {
        panic!("expected for-range");
    };
    assert!(matches!(start, Expr::Number { value: 0, .. }));
    assert!(matches!(end, Expr::Number { value: 10, .. }));
}

#[test]
fn for_over_expression_is_for_list() {
    let program = parse("fn f() { for (x in xs) { x; } }");
    assert!(matches!(
        program.functions[0].body[0],
        Stmt::ForList { .. }
    ));
}

#[test]
fn for_with_two_variables_is_for_dict() {
    let program = parse("fn f() { for (k, v in d) { k; } }");
    let Stmt::ForDict { key, value, .. } = &program.functions[0].body[0] else {
        panic!("expected for-dict");
    };
    assert_eq!(key, "k");
    assert_eq!(value, "v");
}

#[test]
fn if_elif_else_chain() {
    let program = parse(
        "fn f(x) { if (x < 1) { return 1; } elif (x < 2) { return 2; } elif (x < 3) { return 3; } else { return 4; } }",
    );
    let Stmt::If {
        branches,
        else_body,
        ..
    } = &program.functions[0].body[0]
    else {
        panic!("expected if");
    };
    assert_eq!(branches.len(), 3);
    assert_eq!(else_body.len(), 1);
}

#[test]
fn assignment_targets() {
    let program = parse("fn f() { x = 1; a.b = 2; c[0] = 3; }");
    let body = &program.functions[0].body;
    let exprs: Vec<&Expr> = body
        .iter()
        .map(|s| match s {
            Stmt::Expr { expr, .. } => expr,
            other => panic!("expected expression statement, got {:?}", other),
        })
        .collect();
    assert!(matches!(exprs[0], Expr::AssignVariable { .. }));
    assert!(matches!(exprs[1], Expr::AssignProperty { .. }));
    assert!(matches!(exprs[2], Expr::AssignIndex { .. }));
}

#[test]
fn invalid_assignment_target_is_rejected() {
    let err = parse_err("fn f() { 1 + 2 = 3; }");
    assert!(err.message.contains("assignment"));
    assert_eq!(err.scope, "f");
}

#[test]
fn top_level_forms_are_restricted() {
    let err = parse_err("print(1);");
    assert!(err.message.contains("Top-level statement"));
}

#[test]
fn top_level_let_requires_direct_expression() {
    let err = parse_err("let h = spawn work();");
    assert!(err
        .message
        .contains("Top-level let only supports direct expression assignment"));
}

#[test]
fn let_spawn_and_await_forms() {
    let program = parse("fn f() { let h = spawn work(1, 2); let r = await h; }");
    let body = &program.functions[0].body;
    let Stmt::Let {
        init: LetInit::Spawn { callee, args },
        ..
    } = &body[0]
    else {
        panic!("expected let-spawn");
    };
    assert_eq!(callee, "work");
    assert_eq!(args.len(), 2);
    assert!(matches!(
        &body[1],
        Stmt::Let {
            init: LetInit::Await { .. },
            ..
        }
    ));
}

#[test]
fn sleep_and_yield_statements() {
    let program = parse("fn f() { sleep 250; yield; }");
    let body = &program.functions[0].body;
    assert!(matches!(body[0], Stmt::Sleep { millis: 250, .. }));
    assert!(matches!(body[1], Stmt::Yield { .. }));
}

#[test]
fn str_keyword_parses_as_host_reference() {
    let program = parse("fn f(v) { return str(v); }");
    let Stmt::Return { expr, .. } = &program.functions[0].body[0] else {
        panic!("expected return");
    };
    let Expr::Call { callee, .. } = expr else {
        panic!("expected call");
    };
    assert!(matches!(&**callee, Expr::Variable { name, .. } if name == "str"));
}

#[test]
fn dict_literal_entries() {
    let program = parse("fn f() { return {1: \"a\", 2: \"b\"}; }");
    let Stmt::Return { expr, .. } = &program.functions[0].body[0] else {
        panic!("expected return");
    };
    let Expr::DictLit { entries, .. } = expr else {
        panic!("expected dict literal");
    };
    assert_eq!(entries.len(), 2);
}

#[test]
fn missing_semicolon_is_reported_with_position() {
    let err = parse_err("fn f() { let a = 1 }");
    assert!(err.message.contains("';'"));
    assert_eq!(err.pos.line, 1);
}
