//! Recursive-descent parser for rule queries
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! query      := SELECT item (',' item)* [FROM source] [WHERE expr]
//! item       := '*' | expr [[AS] alias]
//! expr       := and (OR and)*
//! and        := not (AND not)*
//! not        := NOT not | predicate
//! predicate  := sum [cmp sum | [NOT] IN '(' list ')' | [NOT] LIKE sum | IS [NOT] NULL]
//! sum        := product (('+' | '-') product)*
//! product    := unary (('*' | '/' | '%') unary)*
//! unary      := '-' unary | primary
//! primary    := literal | '(' expr ')' | function '(' args ')' | path
//! ```

use std::fmt;

use serde_json::Value;

use super::lexer::Token;
use super::SqlError;

const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AS", "AND", "OR", "NOT", "IN", "LIKE", "IS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Ceil,
    Floor,
    Abs,
    Mod,
    Round,
    ClientId,
    ClientIp,
    Topic,
    Qos,
    Uuid,
    NewId,
    CurrentTimestamp,
    LocalTimestamp,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let function = match name.to_ascii_lowercase().as_str() {
            "ceil" => Function::Ceil,
            "floor" => Function::Floor,
            "abs" => Function::Abs,
            "mod" => Function::Mod,
            "round" => Function::Round,
            "clientid" => Function::ClientId,
            "clientip" => Function::ClientIp,
            "topic" => Function::Topic,
            "qos" => Function::Qos,
            "uuid" => Function::Uuid,
            "newid" => Function::NewId,
            "current_timestamp" => Function::CurrentTimestamp,
            "localtimestamp" => Function::LocalTimestamp,
            _ => return None,
        };
        Some(function)
    }

    fn name(self) -> &'static str {
        match self {
            Function::Ceil => "ceil",
            Function::Floor => "floor",
            Function::Abs => "abs",
            Function::Mod => "mod",
            Function::Round => "round",
            Function::ClientId => "clientid",
            Function::ClientIp => "clientip",
            Function::Topic => "topic",
            Function::Qos => "qos",
            Function::Uuid => "uuid",
            Function::NewId => "newid",
            Function::CurrentTimestamp => "CURRENT_TIMESTAMP",
            Function::LocalTimestamp => "LOCALTIMESTAMP",
        }
    }

    /// Accepted argument counts (inclusive)
    fn arity(self) -> (usize, usize) {
        match self {
            Function::Ceil | Function::Floor | Function::Abs => (1, 1),
            Function::Mod => (2, 2),
            Function::Round => (1, 2),
            Function::Topic => (0, 1),
            _ => (0, 0),
        }
    }

    /// Functions that may be written without parentheses
    fn is_niladic_keyword(self) -> bool {
        matches!(self, Function::CurrentTimestamp | Function::LocalTimestamp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// Field path into the message, e.g. `nestMsg.value`
    Path(Vec<String>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Call(Function, Vec<Expr>),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Path(segments) => write!(f, "{}", segments.join(".")),
            Expr::Neg(expr) => write!(f, "-{}", expr),
            Expr::Not(expr) => write!(f, "NOT {}", expr),
            Expr::Binary(left, op, right) => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::In { expr, list, negated } => {
                let items: Vec<String> = list.iter().map(ToString::to_string).collect();
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{} {}IN ({})", expr, not, items.join(", "))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{} {}LIKE {}", expr, not, pattern)
            }
            Expr::IsNull { expr, negated } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{} IS {}NULL", expr, not)
            }
            Expr::Call(function, args) if function.is_niladic_keyword() && args.is_empty() => {
                write!(f, "{}", function.name())
            }
            Expr::Call(function, args) => {
                let items: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "{}({})", function.name(), items.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Projection {
    /// `*`: every field of the input message
    Wildcard,
    Column { expr: Expr, name: String },
}

/// Parsed `SELECT ... [WHERE ...]` statement
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub projections: Vec<Projection>,
    pub condition: Option<Expr>,
}

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub(crate) fn parse_statement(mut self) -> Result<Statement, SqlError> {
        self.expect_keyword("SELECT")?;

        let mut projections = vec![self.parse_projection()?];
        while self.eat(&Token::Comma) {
            projections.push(self.parse_projection()?);
        }

        if self.eat_keyword("FROM") {
            // The source is taken from the rule definition
            match self.next() {
                Some(Token::Ident(_)) | Some(Token::Quoted(_)) | Some(Token::String(_)) => {}
                other => return Err(unexpected("source after FROM", other)),
            }
        }

        let condition = if self.eat_keyword("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };

        if let Some(token) = self.peek() {
            return Err(SqlError::Syntax(format!(
                "unexpected trailing token {:?}",
                token
            )));
        }

        Ok(Statement {
            projections,
            condition,
        })
    }

    fn parse_projection(&mut self) -> Result<Projection, SqlError> {
        if self.eat(&Token::Star) {
            return Ok(Projection::Wildcard);
        }

        let expr = self.parse_expr()?;
        let alias = if self.eat_keyword("AS") {
            Some(self.parse_name()?)
        } else {
            match self.peek() {
                Some(Token::Quoted(_)) => Some(self.parse_name()?),
                Some(Token::Ident(word)) if !is_reserved(word) => Some(self.parse_name()?),
                _ => None,
            }
        };

        let name = alias.unwrap_or_else(|| expr.to_string());
        Ok(Projection::Column { expr, name })
    }

    fn parse_name(&mut self) -> Result<String, SqlError> {
        match self.next() {
            Some(Token::Quoted(name)) => Ok(name),
            Some(Token::Ident(name)) if !is_reserved(&name) => Ok(name),
            other => Err(unexpected("alias", other)),
        }
    }

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("AND") {
            let right = self.parse_not()?;
            left = Expr::Binary(Box::new(left), BinaryOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, SqlError> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr, SqlError> {
        let left = self.parse_sum()?;

        let op = match self.peek() {
            Some(Token::Eq) => Some(BinaryOp::Eq),
            Some(Token::NotEq) => Some(BinaryOp::NotEq),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::LtEq) => Some(BinaryOp::LtEq),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::GtEq) => Some(BinaryOp::GtEq),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.parse_sum()?;
            return Ok(Expr::Binary(Box::new(left), op, Box::new(right)));
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            self.expect(&Token::LParen)?;
            let mut list = vec![self.parse_expr()?];
            while self.eat(&Token::Comma) {
                list.push(self.parse_expr()?);
            }
            self.expect(&Token::RParen)?;
            return Ok(Expr::In {
                expr: Box::new(left),
                list,
                negated,
            });
        }
        if self.eat_keyword("LIKE") {
            let pattern = self.parse_sum()?;
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(pattern),
                negated,
            });
        }
        if negated {
            return Err(unexpected("IN or LIKE after NOT", self.peek().cloned()));
        }

        Ok(left)
    }

    fn parse_sum(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
    }

    fn parse_product(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, SqlError> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, SqlError> {
        match self.next() {
            Some(Token::Integer(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::String(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Quoted(name)) => self.parse_path(name),
            Some(Token::Ident(word)) => {
                if word.eq_ignore_ascii_case("TRUE") {
                    return Ok(Expr::Literal(Value::Bool(true)));
                }
                if word.eq_ignore_ascii_case("FALSE") {
                    return Ok(Expr::Literal(Value::Bool(false)));
                }
                if word.eq_ignore_ascii_case("NULL") {
                    return Ok(Expr::Literal(Value::Null));
                }
                if is_reserved(&word) {
                    return Err(SqlError::Syntax(format!("unexpected keyword {}", word)));
                }

                if let Some(function) = Function::lookup(&word) {
                    if self.peek() == Some(&Token::LParen) {
                        return self.parse_call(function);
                    }
                    if function.is_niladic_keyword() {
                        return Ok(Expr::Call(function, Vec::new()));
                    }
                } else if self.peek() == Some(&Token::LParen) {
                    return Err(SqlError::UnknownFunction(word));
                }

                self.parse_path(word)
            }
            other => Err(unexpected("expression", other)),
        }
    }

    fn parse_call(&mut self, function: Function) -> Result<Expr, SqlError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            args.push(self.parse_expr()?);
            while self.eat(&Token::Comma) {
                args.push(self.parse_expr()?);
            }
            self.expect(&Token::RParen)?;
        }

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            return Err(SqlError::Arity {
                function: function.name(),
                given: args.len(),
            });
        }
        Ok(Expr::Call(function, args))
    }

    fn parse_path(&mut self, first: String) -> Result<Expr, SqlError> {
        let mut segments = vec![first];
        while self.eat(&Token::Dot) {
            match self.next() {
                Some(Token::Ident(name)) | Some(Token::Quoted(name)) => segments.push(name),
                other => return Err(unexpected("field name after '.'", other)),
            }
        }
        Ok(Expr::Path(segments))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), SqlError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(unexpected(&format!("{:?}", token), self.peek().cloned()))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SqlError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(unexpected(keyword, self.peek().cloned()))
        }
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|k| word.eq_ignore_ascii_case(k))
}

fn unexpected(expected: &str, found: Option<Token>) -> SqlError {
    match found {
        Some(token) => SqlError::Syntax(format!("expected {}, found {:?}", expected, token)),
        None => SqlError::Syntax(format!("expected {}, found end of query", expected)),
    }
}
