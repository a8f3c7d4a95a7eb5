//! Recursive-descent parser producing [`QueryAst`].
//!
//! Operator precedence, loosest first: `OR`, `XOR`, `AND`, `NOT`,
//! comparisons (`== != < <= > >= IN NOT IN`), `+ -`, `* / %`, unary minus.

use crate::query::ast::{
    AggregateSpec, BinaryOperator, Clause, CollectClause, Direction, Expr, FilterClause,
    ForClause, ForSource, LetClause, LimitClause, Pos, QueryAst, ReturnClause, ShortestPathSpec,
    SortClause, SortDirection, SortKey, TraversalSpec, UnaryOperator, WeightSpec,
};
use crate::query::errors::SyntaxError;
use crate::query::lexer::{tokenize, Keyword, Token, TokenKind};
use crate::query::value::Value;

/// Parses query text into an AST.
pub fn parse(input: &str) -> Result<QueryAst, SyntaxError> {
    let tokens = tokenize(input)?;
    Parser { tokens, pos: 0 }.query()
}

/// Where in the clause sequence the parser currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Start,
    Body,
    Collected,
    Sorted,
    Limited,
    Returned,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        let idx = self.pos.min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        self.peek().kind == TokenKind::Keyword(kw)
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(message, token.line, token.column)
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        let found = self.peek().kind.describe();
        self.error_here(format!("expected {expected}, found '{found}'"))
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, SyntaxError> {
        if &self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<Token, SyntaxError> {
        self.expect(&TokenKind::Keyword(kw), &kw.spelling().to_uppercase())
    }

    fn ident(&mut self, what: &str) -> Result<String, SyntaxError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn string(&mut self, what: &str) -> Result<String, SyntaxError> {
        match &self.peek().kind {
            TokenKind::Str(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn unsigned(&mut self, what: &str) -> Result<u64, SyntaxError> {
        match self.peek().kind {
            TokenKind::Int(v) if v >= 0 => {
                self.advance();
                Ok(v as u64)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn depth(&mut self) -> Result<u32, SyntaxError> {
        let token = self.peek().clone();
        let value = self.unsigned("traversal depth")?;
        u32::try_from(value)
            .map_err(|_| SyntaxError::new("traversal depth is too large", token.line, token.column))
    }

    fn query(mut self) -> Result<QueryAst, SyntaxError> {
        let mut clauses = Vec::new();
        let mut stage = Stage::Start;
        loop {
            let token = self.peek().clone();
            let pos = Pos {
                line: token.line,
                column: token.column,
            };
            let keyword = match &token.kind {
                TokenKind::Eof => break,
                TokenKind::Keyword(kw) => *kw,
                other => {
                    return Err(self.error_here(format!(
                        "expected a clause keyword, found '{}'",
                        other.describe()
                    )))
                }
            };
            let (allowed, next_stage) = match keyword {
                Keyword::For => (stage <= Stage::Body, Stage::Body),
                Keyword::Let | Keyword::Filter => (stage == Stage::Body, Stage::Body),
                Keyword::Collect => (stage == Stage::Body, Stage::Collected),
                Keyword::Sort => (
                    stage >= Stage::Body && stage <= Stage::Collected,
                    Stage::Sorted,
                ),
                Keyword::Limit => (
                    stage >= Stage::Body && stage <= Stage::Sorted,
                    Stage::Limited,
                ),
                Keyword::Return => (
                    stage >= Stage::Body && stage <= Stage::Limited,
                    Stage::Returned,
                ),
                other => {
                    return Err(self.error_here(format!(
                        "expected a clause keyword, found '{}'",
                        other.spelling().to_uppercase()
                    )))
                }
            };
            if !allowed {
                let name = keyword.spelling().to_uppercase();
                let message = match stage {
                    Stage::Start => format!("query must start with FOR, found {name}"),
                    Stage::Returned => format!("{name} is not allowed after RETURN"),
                    Stage::Collected => format!("{name} is not allowed after COLLECT"),
                    Stage::Sorted => format!("{name} is not allowed after SORT"),
                    Stage::Limited => format!("{name} is not allowed after LIMIT"),
                    Stage::Body => format!("{name} is not allowed here"),
                };
                return Err(SyntaxError::new(message, pos.line, pos.column));
            }
            self.advance();
            let clause = match keyword {
                Keyword::For => Clause::For(self.for_clause(pos)?),
                Keyword::Let => Clause::Let(self.let_clause(pos)?),
                Keyword::Filter => Clause::Filter(FilterClause {
                    condition: self.expr()?,
                    pos,
                }),
                Keyword::Collect => Clause::Collect(self.collect_clause(pos)?),
                Keyword::Sort => Clause::Sort(self.sort_clause()?),
                Keyword::Limit => Clause::Limit(self.limit_clause()?),
                Keyword::Return => Clause::Return(ReturnClause { expr: self.expr()? }),
                _ => unreachable!("clause keywords are filtered above"),
            };
            clauses.push(clause);
            stage = next_stage;
        }
        if stage != Stage::Returned {
            let token = self.peek();
            let message = if stage == Stage::Start {
                "empty query"
            } else {
                "query must end with RETURN"
            };
            return Err(SyntaxError::new(message, token.line, token.column));
        }
        Ok(QueryAst { clauses })
    }

    fn for_clause(&mut self, pos: Pos) -> Result<ForClause, SyntaxError> {
        let variable = self.ident("loop variable")?;
        let mut edge_variable = None;
        let mut path_variable = None;
        if self.eat(&TokenKind::Comma) {
            edge_variable = Some(self.ident("edge variable")?);
            if self.eat(&TokenKind::Comma) {
                path_variable = Some(self.ident("path variable")?);
            }
        }
        self.expect_keyword(Keyword::In)?;
        let source_token = self.peek().clone();
        let source = self.for_source()?;
        if matches!(source, ForSource::Collection { .. })
            && (edge_variable.is_some() || path_variable.is_some())
        {
            return Err(SyntaxError::new(
                "only graph traversals bind edge and path variables",
                source_token.line,
                source_token.column,
            ));
        }
        Ok(ForClause {
            variable,
            edge_variable,
            path_variable,
            source,
            pos,
        })
    }

    fn for_source(&mut self) -> Result<ForSource, SyntaxError> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(ForSource::Collection { name })
            }
            TokenKind::Int(_) => {
                let min_depth = self.depth()?;
                let max_depth = if self.eat(&TokenKind::DotDot) {
                    self.depth()?
                } else {
                    min_depth
                };
                if max_depth < min_depth {
                    return Err(self.error_here(format!(
                        "traversal range {min_depth}..{max_depth} is empty"
                    )));
                }
                let direction = self.direction()?;
                self.traversal(min_depth, max_depth, direction)
            }
            TokenKind::Keyword(Keyword::Outbound | Keyword::Inbound | Keyword::Any) => {
                let direction = self.direction()?;
                if self.eat_keyword(Keyword::ShortestPath) {
                    self.shortest_path(direction)
                } else {
                    self.traversal(1, 1, direction)
                }
            }
            _ => Err(self.unexpected("collection name or traversal")),
        }
    }

    fn direction(&mut self) -> Result<Direction, SyntaxError> {
        let direction = match self.peek().kind {
            TokenKind::Keyword(Keyword::Outbound) => Direction::Outbound,
            TokenKind::Keyword(Keyword::Inbound) => Direction::Inbound,
            TokenKind::Keyword(Keyword::Any) => Direction::Any,
            _ => return Err(self.unexpected("OUTBOUND, INBOUND or ANY")),
        };
        self.advance();
        Ok(direction)
    }

    fn edge_type(&mut self) -> Result<Option<String>, SyntaxError> {
        if self.eat_keyword(Keyword::Type) {
            Ok(Some(self.string("edge type string")?))
        } else {
            Ok(None)
        }
    }

    fn traversal(
        &mut self,
        min_depth: u32,
        max_depth: u32,
        direction: Direction,
    ) -> Result<ForSource, SyntaxError> {
        let start = self.string("start vertex string")?;
        let edge_type = self.edge_type()?;
        self.expect_keyword(Keyword::Graph)?;
        let graph = self.string("graph name string")?;
        Ok(ForSource::Traversal(TraversalSpec {
            min_depth,
            max_depth,
            direction,
            start,
            edge_type,
            graph,
        }))
    }

    fn shortest_path(&mut self, direction: Direction) -> Result<ForSource, SyntaxError> {
        let start = self.string("start vertex string")?;
        self.expect_keyword(Keyword::To)?;
        let target = self.string("target vertex string")?;
        let edge_type = self.edge_type()?;
        self.expect_keyword(Keyword::Graph)?;
        let graph = self.string("graph name string")?;
        let weight = if self.eat_keyword(Keyword::Weight) {
            let attribute = self.string("weight attribute string")?;
            let default = if self.eat_keyword(Keyword::Default) {
                self.signed_number("default weight")?
            } else {
                1.0
            };
            Some(WeightSpec { attribute, default })
        } else {
            None
        };
        Ok(ForSource::ShortestPath(ShortestPathSpec {
            direction,
            start,
            target,
            edge_type,
            graph,
            weight,
        }))
    }

    fn signed_number(&mut self, what: &str) -> Result<f64, SyntaxError> {
        let negative = self.eat(&TokenKind::Minus);
        let value = match self.peek().kind {
            TokenKind::Int(v) => v as f64,
            TokenKind::Float(v) => v,
            _ => return Err(self.unexpected(what)),
        };
        self.advance();
        Ok(if negative { -value } else { value })
    }

    fn let_clause(&mut self, pos: Pos) -> Result<LetClause, SyntaxError> {
        let variable = self.ident("variable name")?;
        self.expect(&TokenKind::Assign, "'='")?;
        let value = self.expr()?;
        Ok(LetClause {
            variable,
            value,
            pos,
        })
    }

    fn collect_clause(&mut self, pos: Pos) -> Result<CollectClause, SyntaxError> {
        let mut groups = Vec::new();
        if matches!(self.peek().kind, TokenKind::Ident(_)) {
            loop {
                let name = self.ident("group variable")?;
                self.expect(&TokenKind::Assign, "'='")?;
                groups.push((name, self.expr()?));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let mut aggregates = Vec::new();
        if self.eat_keyword(Keyword::Aggregate) {
            loop {
                let variable = self.ident("aggregate variable")?;
                self.expect(&TokenKind::Assign, "'='")?;
                let function = self.ident("aggregate function")?.to_ascii_uppercase();
                self.expect(&TokenKind::LParen, "'('")?;
                let argument = self.expr()?;
                let mut parameters = Vec::new();
                while self.eat(&TokenKind::Comma) {
                    parameters.push(self.expr()?);
                }
                self.expect(&TokenKind::RParen, "')'")?;
                aggregates.push(AggregateSpec {
                    variable,
                    function,
                    argument,
                    parameters,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        if groups.is_empty() && aggregates.is_empty() {
            return Err(self.unexpected("group or AGGREGATE expression"));
        }
        Ok(CollectClause {
            groups,
            aggregates,
            pos,
        })
    }

    fn sort_clause(&mut self) -> Result<SortClause, SyntaxError> {
        let mut keys = Vec::new();
        loop {
            let expr = self.expr()?;
            let direction = if self.eat_keyword(Keyword::Desc) {
                SortDirection::Desc
            } else {
                self.eat_keyword(Keyword::Asc);
                SortDirection::Asc
            };
            keys.push(SortKey { expr, direction });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(SortClause { keys })
    }

    fn limit_clause(&mut self) -> Result<LimitClause, SyntaxError> {
        let first = self.unsigned("non-negative integer")?;
        if self.eat(&TokenKind::Comma) {
            let count = self.unsigned("non-negative integer")?;
            Ok(LimitClause {
                offset: first,
                count,
            })
        } else {
            Ok(LimitClause {
                offset: 0,
                count: first,
            })
        }
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.xor_expr()?;
        while self.eat_keyword(Keyword::Or) || self.eat(&TokenKind::OrOr) {
            let right = self.xor_expr()?;
            left = Expr::binary(BinaryOperator::Or, left, right);
        }
        Ok(left)
    }

    fn xor_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and_expr()?;
        while self.eat_keyword(Keyword::Xor) {
            let right = self.and_expr()?;
            left = Expr::binary(BinaryOperator::Xor, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.not_expr()?;
        while self.eat_keyword(Keyword::And) || self.eat(&TokenKind::AndAnd) {
            let right = self.not_expr()?;
            left = Expr::binary(BinaryOperator::And, left, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_keyword(Keyword::Not) || self.eat(&TokenKind::Bang) {
            let operand = self.not_expr()?;
            return Ok(Expr::not(operand));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.additive()?;
        let op = match &self.peek().kind {
            TokenKind::EqEq => BinaryOperator::Eq,
            TokenKind::NotEq => BinaryOperator::Ne,
            TokenKind::Lt => BinaryOperator::Lt,
            TokenKind::Le => BinaryOperator::Le,
            TokenKind::Gt => BinaryOperator::Gt,
            TokenKind::Ge => BinaryOperator::Ge,
            TokenKind::Keyword(Keyword::In) => BinaryOperator::In,
            TokenKind::Keyword(Keyword::Not)
                if self.peek_kind_at(1) == &TokenKind::Keyword(Keyword::In) =>
            {
                self.advance();
                BinaryOperator::NotIn
            }
            TokenKind::Assign => {
                return Err(self.error_here("'=' is assignment; use '==' to compare"));
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(Expr::binary(op, left, right))
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOperator::Mul,
                TokenKind::Slash => BinaryOperator::Div,
                TokenKind::Percent => BinaryOperator::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat(&TokenKind::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOperator::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat(&TokenKind::Plus) {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Int(v) => {
                self.advance();
                Ok(Expr::literal(v))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Expr::literal(v))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::literal(s))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::literal(true))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::literal(false))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Literal { value: Value::Null })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let elements = self.list(&TokenKind::RBracket, "']'")?;
                Ok(Expr::Array { elements })
            }
            TokenKind::LBrace => {
                self.advance();
                self.object()
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let args = self.list(&TokenKind::RParen, "')'")?;
                    return Ok(Expr::FunctionCall {
                        name: name.to_ascii_uppercase(),
                        args,
                    });
                }
                let mut path = Vec::new();
                while self.eat(&TokenKind::Dot) {
                    path.push(self.attribute_name()?);
                }
                if path.is_empty() {
                    Ok(Expr::Variable { name })
                } else {
                    Ok(Expr::FieldAccess {
                        variable: name,
                        path,
                    })
                }
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn attribute_name(&mut self) -> Result<String, SyntaxError> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            TokenKind::Keyword(kw) => {
                self.advance();
                Ok(kw.spelling().to_owned())
            }
            _ => Err(self.unexpected("attribute name")),
        }
    }

    fn list(&mut self, close: &TokenKind, expected: &str) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat(close) {
                return Ok(items);
            }
            if !self.eat(&TokenKind::Comma) {
                return Err(self.unexpected(&format!("',' or {expected}")));
            }
        }
    }

    fn object(&mut self) -> Result<Expr, SyntaxError> {
        let mut fields = Vec::new();
        if self.eat(&TokenKind::RBrace) {
            return Ok(Expr::Object { fields });
        }
        loop {
            let key = match self.peek().kind.clone() {
                TokenKind::Ident(name) => name,
                TokenKind::Str(s) => s,
                TokenKind::Keyword(kw) => kw.spelling().to_owned(),
                _ => return Err(self.unexpected("object key")),
            };
            let key_is_ident = matches!(self.peek().kind, TokenKind::Ident(_));
            self.advance();
            let value = if self.eat(&TokenKind::Colon) {
                self.expr()?
            } else if key_is_ident {
                Expr::Variable { name: key.clone() }
            } else {
                return Err(self.unexpected("':'"));
            };
            fields.push((key, value));
            if self.eat(&TokenKind::RBrace) {
                return Ok(Expr::Object { fields });
            }
            if !self.eat(&TokenKind::Comma) {
                return Err(self.unexpected("',' or '}'"));
            }
        }
    }
}
