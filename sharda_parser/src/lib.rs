//! Narrow SQL dialect parser used for shard routing.
#![deny(missing_docs)]

mod ast;
mod token;

pub use ast::*;
pub use token::{LexItem, Lexer, Span, Token};

/// Recursive-descent statement parser.
pub mod parser;

pub use parser::{parse, ParseError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_simple_select() {
        let sql = "SELECT * FROM users;";
        let kinds: Vec<Token> = Lexer::new(sql).map(|t| t.unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                Token::Select,
                Token::Star,
                Token::From,
                Token::Ident("users".into()),
                Token::Semicolon
            ]
        );
    }
}
