use crate::ast::{
    CmpOp, ColumnDef, CreateTable, Delete, Expr, Insert, OrderBy, Predicate, Select, SelectItem,
    Statement, Update, Value,
};
use crate::token::{LexItem, Lexer, Token};
use thiserror::Error;

/// Parsing error with location info.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// Empty statement text.
    #[error("empty statement")]
    Empty,
    /// Unexpected end-of-input.
    #[error("unexpected end of input")]
    Eof,
    /// Character sequence the lexer does not know.
    #[error("invalid input at byte {0}")]
    InvalidInput(usize),
    /// Unexpected token.
    #[error("unexpected token {token:?} at byte {offset}")]
    Unexpected {
        /// Offending token.
        token: Token,
        /// Byte offset of the token.
        offset: usize,
    },
    /// Syntactically valid SQL outside the supported dialect.
    #[error("unsupported statement: {0}")]
    Unsupported(&'static str),
}

/// Parse an SQL string into an AST [`Statement`].
pub fn parse(sql: &str) -> Result<Statement, ParseError> {
    let tokens = Lexer::new(sql)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|span| ParseError::InvalidInput(span.start))?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut p = Parser {
        tokens,
        pos: 0,
        placeholders: 0,
    };
    let stmt = p.statement()?;
    p.eat(&Token::Semicolon);
    match p.tokens.get(p.pos) {
        None => Ok(stmt),
        Some(item) => Err(ParseError::Unexpected {
            token: item.kind.clone(),
            offset: item.span.start,
        }),
    }
}

struct Parser {
    tokens: Vec<LexItem>,
    pos: usize,
    placeholders: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn next(&mut self) -> Result<LexItem, ParseError> {
        let item = self.tokens.get(self.pos).cloned().ok_or(ParseError::Eof)?;
        self.pos += 1;
        Ok(item)
    }

    fn unexpected(item: &LexItem) -> ParseError {
        ParseError::Unexpected {
            token: item.kind.clone(),
            offset: item.span.start,
        }
    }

    /// Consume `tok` if it is next.
    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token) -> Result<(), ParseError> {
        let item = self.next()?;
        if item.kind == tok {
            Ok(())
        } else {
            Err(Self::unexpected(&item))
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        let item = self.next()?;
        match &item.kind {
            Token::Ident(name) => Ok(name.clone()),
            _ => Err(Self::unexpected(&item)),
        }
    }

    /// Possibly qualified name; only the last segment is kept.
    fn object_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.ident()?;
        while self.eat(&Token::Dot) {
            name = self.ident()?;
        }
        Ok(name)
    }

    fn statement(&mut self) -> Result<Statement, ParseError> {
        let item = self.next()?;
        match item.kind {
            Token::Select => self.select(),
            Token::Insert => self.insert(),
            Token::Update => self.update(),
            Token::Delete => self.delete(),
            Token::Create => self.create_table(),
            Token::Drop => self.drop_table(),
            Token::Truncate => {
                self.eat(&Token::Table);
                let table = self.object_name()?;
                Ok(Statement::Truncate { table })
            }
            _ => Err(Self::unexpected(&item)),
        }
    }

    fn create_table(&mut self) -> Result<Statement, ParseError> {
        if self.peek() != Some(&Token::Table) {
            return Err(ParseError::Unsupported("only CREATE TABLE is supported"));
        }
        self.expect(Token::Table)?;
        let if_not_exists = if self.eat(&Token::If) {
            self.expect(Token::Not)?;
            self.expect(Token::Exists)?;
            true
        } else {
            false
        };
        let table = self.object_name()?;
        self.expect(Token::LParen)?;
        let mut columns: Vec<ColumnDef> = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Primary) => {
                    self.pos += 1;
                    self.expect(Token::Key)?;
                    for name in self.name_list()? {
                        match columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(&name)) {
                            Some(col) => col.primary_key = true,
                            None => return Err(ParseError::Unsupported("primary key names an unknown column")),
                        }
                    }
                }
                Some(Token::Unique) => {
                    self.pos += 1;
                    for name in self.name_list()? {
                        if let Some(col) = columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(&name)) {
                            col.unique = true;
                        }
                    }
                }
                _ => columns.push(self.column_def()?),
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;
        Ok(Statement::CreateTable(CreateTable {
            table,
            if_not_exists,
            columns,
        }))
    }

    fn column_def(&mut self) -> Result<ColumnDef, ParseError> {
        let name = self.ident()?;
        let mut data_type = String::new();
        while let Some(Token::Ident(word)) = self.peek() {
            if !data_type.is_empty() {
                data_type.push(' ');
            }
            data_type.push_str(word);
            self.pos += 1;
        }
        if self.eat(&Token::LParen) {
            let mut args = Vec::new();
            loop {
                let item = self.next()?;
                match item.kind {
                    Token::Integer(n) => args.push(n.to_string()),
                    _ => return Err(Self::unexpected(&item)),
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen)?;
            data_type = format!("{data_type}({})", args.join(","));
        }
        let mut col = ColumnDef {
            name,
            data_type,
            primary_key: false,
            autoincrement: false,
            not_null: false,
            unique: false,
            default: None,
        };
        loop {
            match self.peek() {
                Some(Token::Not) => {
                    self.pos += 1;
                    self.expect(Token::Null)?;
                    col.not_null = true;
                }
                Some(Token::Null) => self.pos += 1,
                Some(Token::Primary) => {
                    self.pos += 1;
                    self.expect(Token::Key)?;
                    col.primary_key = true;
                }
                Some(Token::Autoincrement) => {
                    self.pos += 1;
                    col.autoincrement = true;
                }
                Some(Token::Unique) => {
                    self.pos += 1;
                    col.unique = true;
                }
                Some(Token::Default) => {
                    self.pos += 1;
                    match self.expr()? {
                        Expr::Literal(v) => col.default = Some(v),
                        Expr::Placeholder(_) => {
                            return Err(ParseError::Unsupported("placeholder in column default"))
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(col)
    }

    fn drop_table(&mut self) -> Result<Statement, ParseError> {
        self.expect(Token::Table)?;
        let if_exists = if self.eat(&Token::If) {
            self.expect(Token::Exists)?;
            true
        } else {
            false
        };
        let table = self.object_name()?;
        Ok(Statement::DropTable { table, if_exists })
    }

    fn name_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(Token::LParen)?;
        let mut names = vec![self.ident()?];
        while self.eat(&Token::Comma) {
            names.push(self.ident()?);
        }
        self.expect(Token::RParen)?;
        Ok(names)
    }

    fn insert(&mut self) -> Result<Statement, ParseError> {
        self.expect(Token::Into)?;
        let table = self.object_name()?;
        let columns = if self.peek() == Some(&Token::LParen) {
            self.name_list()?
        } else {
            Vec::new()
        };
        self.expect(Token::Values)?;
        self.expect(Token::LParen)?;
        let mut values = vec![self.expr()?];
        while self.eat(&Token::Comma) {
            values.push(self.expr()?);
        }
        self.expect(Token::RParen)?;
        if self.peek() == Some(&Token::Comma) {
            return Err(ParseError::Unsupported("multi-row INSERT"));
        }
        if !columns.is_empty() && columns.len() != values.len() {
            return Err(ParseError::Unsupported("INSERT column and value counts differ"));
        }
        Ok(Statement::Insert(Insert {
            table,
            columns,
            values,
        }))
    }

    fn select(&mut self) -> Result<Statement, ParseError> {
        let mut projection = Vec::new();
        loop {
            if self.eat(&Token::Star) {
                projection.push(SelectItem::Star);
            } else {
                projection.push(SelectItem::Column(self.object_name()?));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::From)?;
        let table = self.object_name()?;
        let filter = self.where_clause()?;
        let order_by = if self.eat(&Token::Order) {
            self.expect(Token::By)?;
            let column = self.object_name()?;
            let descending = if self.eat(&Token::Desc) {
                true
            } else {
                self.eat(&Token::Asc);
                false
            };
            Some(OrderBy { column, descending })
        } else {
            None
        };
        let limit = if self.eat(&Token::Limit) {
            let item = self.next()?;
            match item.kind {
                Token::Integer(n) if n >= 0 => Some(n as u64),
                _ => return Err(Self::unexpected(&item)),
            }
        } else {
            None
        };
        Ok(Statement::Select(Select {
            table,
            projection,
            filter,
            order_by,
            limit,
        }))
    }

    fn update(&mut self) -> Result<Statement, ParseError> {
        let table = self.object_name()?;
        self.expect(Token::Set)?;
        let mut assignments = Vec::new();
        loop {
            let column = self.object_name()?;
            self.expect(Token::Eq)?;
            assignments.push((column, self.expr()?));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let filter = self.where_clause()?;
        Ok(Statement::Update(Update {
            table,
            assignments,
            filter,
        }))
    }

    fn delete(&mut self) -> Result<Statement, ParseError> {
        self.expect(Token::From)?;
        let table = self.object_name()?;
        let filter = self.where_clause()?;
        Ok(Statement::Delete(Delete { table, filter }))
    }

    fn where_clause(&mut self) -> Result<Option<Predicate>, ParseError> {
        if self.eat(&Token::Where) {
            Ok(Some(self.or_predicate()?))
        } else {
            Ok(None)
        }
    }

    fn or_predicate(&mut self) -> Result<Predicate, ParseError> {
        let mut left = self.and_predicate()?;
        while self.eat(&Token::Or) {
            let right = self.and_predicate()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_predicate(&mut self) -> Result<Predicate, ParseError> {
        let mut left = self.atom_predicate()?;
        while self.eat(&Token::And) {
            let right = self.atom_predicate()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn atom_predicate(&mut self) -> Result<Predicate, ParseError> {
        if self.eat(&Token::LParen) {
            let inner = self.or_predicate()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        let column = self.object_name()?;
        if self.eat(&Token::Is) {
            let negated = self.eat(&Token::Not);
            self.expect(Token::Null)?;
            return Ok(Predicate::IsNull { column, negated });
        }
        let item = self.next()?;
        let op = match item.kind {
            Token::Eq => CmpOp::Eq,
            Token::NotEq => CmpOp::NotEq,
            Token::Lt => CmpOp::Lt,
            Token::LtEq => CmpOp::LtEq,
            Token::Gt => CmpOp::Gt,
            Token::GtEq => CmpOp::GtEq,
            _ => return Err(Self::unexpected(&item)),
        };
        let value = self.expr()?;
        Ok(Predicate::Compare { column, op, value })
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let item = self.next()?;
        let expr = match &item.kind {
            Token::Null => Expr::Literal(Value::Null),
            Token::Integer(n) => Expr::Literal(Value::Integer(*n)),
            Token::Real(r) => Expr::Literal(Value::Real(*r)),
            Token::String(s) => Expr::Literal(Value::Text(s.clone())),
            Token::Placeholder => {
                let idx = self.placeholders;
                self.placeholders += 1;
                Expr::Placeholder(idx)
            }
            Token::Minus => {
                let item = self.next()?;
                match item.kind {
                    Token::Integer(n) => Expr::Literal(Value::Integer(-n)),
                    Token::Real(r) => Expr::Literal(Value::Real(-r)),
                    _ => return Err(Self::unexpected(&item)),
                }
            }
            _ => return Err(Self::unexpected(&item)),
        };
        Ok(expr)
    }
}
