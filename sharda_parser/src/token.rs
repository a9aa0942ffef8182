use logos::Logos;

/// Position range of a token (byte offset).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Span {
    /// Start byte offset (inclusive).
    pub start: usize,
    /// End byte offset (exclusive).
    pub end: usize,
}

fn unquote(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    inner.replace("''", "'")
}

fn strip_delimiters(slice: &str) -> String {
    slice[1..slice.len() - 1].to_string()
}

/// SQL token kinds recognised by the lexer.
#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\n\r\f]+")]
pub enum Token {
    /// `SELECT` keyword.
    #[token("select", ignore(ascii_case))]
    Select,
    /// `INSERT` keyword.
    #[token("insert", ignore(ascii_case))]
    Insert,
    /// `UPDATE` keyword.
    #[token("update", ignore(ascii_case))]
    Update,
    /// `DELETE` keyword.
    #[token("delete", ignore(ascii_case))]
    Delete,
    /// `CREATE` keyword.
    #[token("create", ignore(ascii_case))]
    Create,
    /// `DROP` keyword.
    #[token("drop", ignore(ascii_case))]
    Drop,
    /// `TRUNCATE` keyword.
    #[token("truncate", ignore(ascii_case))]
    Truncate,
    /// `TABLE` keyword.
    #[token("table", ignore(ascii_case))]
    Table,
    /// `IF` keyword.
    #[token("if", ignore(ascii_case))]
    If,
    /// `NOT` keyword.
    #[token("not", ignore(ascii_case))]
    Not,
    /// `EXISTS` keyword.
    #[token("exists", ignore(ascii_case))]
    Exists,
    /// `INTO` keyword.
    #[token("into", ignore(ascii_case))]
    Into,
    /// `VALUES` keyword.
    #[token("values", ignore(ascii_case))]
    Values,
    /// `FROM` keyword.
    #[token("from", ignore(ascii_case))]
    From,
    /// `WHERE` keyword.
    #[token("where", ignore(ascii_case))]
    Where,
    /// `SET` keyword.
    #[token("set", ignore(ascii_case))]
    Set,
    /// `AND` keyword.
    #[token("and", ignore(ascii_case))]
    And,
    /// `OR` keyword.
    #[token("or", ignore(ascii_case))]
    Or,
    /// `IS` keyword.
    #[token("is", ignore(ascii_case))]
    Is,
    /// `NULL` keyword.
    #[token("null", ignore(ascii_case))]
    Null,
    /// `ORDER` keyword.
    #[token("order", ignore(ascii_case))]
    Order,
    /// `BY` keyword.
    #[token("by", ignore(ascii_case))]
    By,
    /// `ASC` keyword.
    #[token("asc", ignore(ascii_case))]
    Asc,
    /// `DESC` keyword.
    #[token("desc", ignore(ascii_case))]
    Desc,
    /// `LIMIT` keyword.
    #[token("limit", ignore(ascii_case))]
    Limit,
    /// `PRIMARY` keyword.
    #[token("primary", ignore(ascii_case))]
    Primary,
    /// `KEY` keyword.
    #[token("key", ignore(ascii_case))]
    Key,
    /// `AUTOINCREMENT` / `AUTO_INCREMENT` keyword.
    #[token("autoincrement", ignore(ascii_case))]
    #[token("auto_increment", ignore(ascii_case))]
    Autoincrement,
    /// `UNIQUE` keyword.
    #[token("unique", ignore(ascii_case))]
    Unique,
    /// `DEFAULT` keyword.
    #[token("default", ignore(ascii_case))]
    Default,
    /// Comma `,`.
    #[token(",")]
    Comma,
    /// Dot `.`.
    #[token(".")]
    Dot,
    /// Asterisk `*`.
    #[token("*")]
    Star,
    /// Semicolon `;`.
    #[token(";")]
    Semicolon,
    /// Left parenthesis `(`.
    #[token("(")]
    LParen,
    /// Right parenthesis `)`.
    #[token(")")]
    RParen,
    /// Positional placeholder `?`.
    #[token("?")]
    Placeholder,
    /// `=`.
    #[token("=")]
    Eq,
    /// `!=` or `<>`.
    #[token("!=")]
    #[token("<>")]
    NotEq,
    /// `<`.
    #[token("<")]
    Lt,
    /// `<=`.
    #[token("<=")]
    LtEq,
    /// `>`.
    #[token(">")]
    Gt,
    /// `>=`.
    #[token(">=")]
    GtEq,
    /// `-`.
    #[token("-")]
    Minus,
    /// Integer literal.
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Integer(i64),
    /// Real literal.
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Real(f64),
    /// String literal, quotes removed and `''` unescaped.
    #[regex(r"'([^']|'')*'", |lex| unquote(lex.slice()))]
    String(String),
    /// Identifier (table/column), bare or quoted with backticks or double quotes.
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    #[regex(r"`[^`]+`", |lex| strip_delimiters(lex.slice()))]
    #[regex(r#""[^"]+""#, |lex| strip_delimiters(lex.slice()))]
    Ident(String),
}

/// Output of the lexer containing token and span.
#[derive(Debug, Clone, PartialEq)]
pub struct LexItem {
    /// Token kind.
    pub kind: Token,
    /// Text span.
    pub span: Span,
}

/// Lexer iterator over `LexItem`s. Unrecognised input yields `Err(span)`.
pub struct Lexer<'input> {
    inner: logos::Lexer<'input, Token>,
}

impl<'input> Lexer<'input> {
    /// Create new lexer from SQL text slice.
    pub fn new(source: &'input str) -> Self {
        Self {
            inner: Token::lexer(source),
        }
    }
}

impl<'input> Iterator for Lexer<'input> {
    type Item = Result<LexItem, Span>;

    fn next(&mut self) -> Option<Self::Item> {
        let kind = self.inner.next()?;
        let span = Span {
            start: self.inner.span().start,
            end: self.inner.span().end,
        };
        Some(kind.map(|kind| LexItem { kind, span }).map_err(|_| span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<Token> {
        Lexer::new(sql).map(|t| t.unwrap().kind).collect()
    }

    #[test]
    fn keywords_ignore_case() {
        assert_eq!(
            kinds("select FROM Where"),
            vec![Token::Select, Token::From, Token::Where]
        );
    }

    #[test]
    fn identifiers_are_not_keywords_by_prefix() {
        assert_eq!(
            kinds("settings users"),
            vec![Token::Ident("settings".into()), Token::Ident("users".into())]
        );
    }

    #[test]
    fn literals_and_placeholders() {
        assert_eq!(
            kinds("10 2.5 'it''s' ? `user id`"),
            vec![
                Token::Integer(10),
                Token::Real(2.5),
                Token::String("it's".into()),
                Token::Placeholder,
                Token::Ident("user id".into()),
            ]
        );
    }

    #[test]
    fn unknown_character_is_error() {
        let items: Vec<_> = Lexer::new("select #").collect();
        assert_eq!(items[1], Err(Span { start: 7, end: 8 }));
    }
}
