use super::tokens::{Token, TokenKind};
use super::{tokenize, LexError};

fn kinds(source: &str) -> Vec<TokenKind> {
    tokenize(source)
        .expect("tokenizes")
        .into_iter()
        .map(|t| t.kind)
        .collect()
}

#[test]
fn tokenizes_function_header() {
    assert_eq!(
        kinds("fn main() {}"),
        vec![
            TokenKind::KwFn,
            TokenKind::Identifier("main".into()),
            TokenKind::LParen,
            TokenKind::RParen,
            TokenKind::LBrace,
            TokenKind::RBrace,
            TokenKind::End,
        ]
    );
}

#[test]
fn recognizes_every_keyword() {
    let source = "fn class extends let for in if elif else while break continue str return spawn await sleep yield";
    let expected = vec![
        TokenKind::KwFn,
        TokenKind::KwClass,
        TokenKind::KwExtends,
        TokenKind::KwLet,
        TokenKind::KwFor,
        TokenKind::KwIn,
        TokenKind::KwIf,
        TokenKind::KwElif,
        TokenKind::KwElse,
        TokenKind::KwWhile,
        TokenKind::KwBreak,
        TokenKind::KwContinue,
        TokenKind::KwStr,
        TokenKind::KwReturn,
        TokenKind::KwSpawn,
        TokenKind::KwAwait,
        TokenKind::KwSleep,
        TokenKind::KwYield,
        TokenKind::End,
    ];
    assert_eq!(kinds(source), expected);
}

#[test]
fn two_character_operators() {
    assert_eq!(
        kinds("== != <= >= = < > !"),
        vec![
            TokenKind::EqualEqual,
            TokenKind::BangEqual,
            TokenKind::LessEqual,
            TokenKind::GreaterEqual,
            TokenKind::Equal,
            TokenKind::Less,
            TokenKind::Greater,
            TokenKind::Bang,
            TokenKind::End,
        ]
    );
}

#[test]
fn numbers_truncate_fractional_part() {
    assert_eq!(
        kinds("3 3.7 0.2"),
        vec![
            TokenKind::Number(3),
            TokenKind::Number(3),
            TokenKind::Number(0),
            TokenKind::End,
        ]
    );
}

#[test]
fn dot_without_digits_stays_postfix() {
    assert_eq!(
        kinds("1.size"),
        vec![
            TokenKind::Number(1),
            TokenKind::Dot,
            TokenKind::Identifier("size".into()),
            TokenKind::End,
        ]
    );
}

#[test]
fn string_escapes() {
    assert_eq!(
        kinds(r#""a\nb\t\"q\"\\""#),
        vec![
            TokenKind::StringLiteral("a\nb\t\"q\"\\".into()),
            TokenKind::End,
        ]
    );
}

#[test]
fn comments_are_skipped() {
    let source = "1 # hash comment\n2 // line comment\n3 /* block\ncomment */ 4";
    assert_eq!(
        kinds(source),
        vec![
            TokenKind::Number(1),
            TokenKind::Number(2),
            TokenKind::Number(3),
            TokenKind::Number(4),
            TokenKind::End,
        ]
    );
}

#[test]
fn positions_track_lines_and_columns() {
    let tokens: Vec<Token> = tokenize("let x = 1;\n  x;").unwrap();
    assert_eq!(tokens[0].pos.line, 1);
    assert_eq!(tokens[0].pos.column, 1);
    let x_use = &tokens[5];
    assert_eq!(x_use.kind, TokenKind::Identifier("x".into()));
    assert_eq!(x_use.pos.line, 2);
    assert_eq!(x_use.pos.column, 3);
}

#[test]
fn unterminated_string_is_an_error() {
    assert!(matches!(
        tokenize("\"abc"),
        Err(LexError::UnterminatedString { .. })
    ));
}

#[test]
fn unterminated_block_comment_is_an_error() {
    assert!(matches!(
        tokenize("/* never closed"),
        Err(LexError::UnterminatedBlockComment { .. })
    ));
}

#[test]
fn unexpected_character_reports_position() {
    match tokenize("let a = 1;\n@") {
        Err(LexError::UnexpectedChar { pos, ch }) => {
            assert_eq!(ch, '@');
            assert_eq!(pos.line, 2);
            assert_eq!(pos.column, 1);
        }
        other => panic!("expected UnexpectedChar, got {:?}", other),
    }
}

#[test]
fn error_message_carries_scope_tag() {
    let err = tokenize("$").unwrap_err();
    let message = err.to_string();
    assert!(message.contains("1:1: error:"));
    assert!(message.contains("[function: <module>]"));
}
