//! Tokenizer for the query language.

use crate::query::errors::SyntaxError;

/// Reserved words; matched case-insensitively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keyword {
    /// `FOR`
    For,
    /// `IN`
    In,
    /// `FILTER`
    Filter,
    /// `SORT`
    Sort,
    /// `LIMIT`
    Limit,
    /// `RETURN`
    Return,
    /// `LET`
    Let,
    /// `COLLECT`
    Collect,
    /// `AGGREGATE`
    Aggregate,
    /// `ASC`
    Asc,
    /// `DESC`
    Desc,
    /// `AND`
    And,
    /// `OR`
    Or,
    /// `XOR`
    Xor,
    /// `NOT`
    Not,
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
    /// `GRAPH`
    Graph,
    /// `OUTBOUND`
    Outbound,
    /// `INBOUND`
    Inbound,
    /// `ANY`
    Any,
    /// `TYPE`
    Type,
    /// `SHORTEST_PATH`
    ShortestPath,
    /// `TO`
    To,
    /// `WEIGHT`
    Weight,
    /// `DEFAULT`
    Default,
}

impl Keyword {
    fn lookup(word: &str) -> Option<Keyword> {
        let upper = word.to_ascii_uppercase();
        Some(match upper.as_str() {
            "FOR" => Keyword::For,
            "IN" => Keyword::In,
            "FILTER" => Keyword::Filter,
            "SORT" => Keyword::Sort,
            "LIMIT" => Keyword::Limit,
            "RETURN" => Keyword::Return,
            "LET" => Keyword::Let,
            "COLLECT" => Keyword::Collect,
            "AGGREGATE" => Keyword::Aggregate,
            "ASC" => Keyword::Asc,
            "DESC" => Keyword::Desc,
            "AND" => Keyword::And,
            "OR" => Keyword::Or,
            "XOR" => Keyword::Xor,
            "NOT" => Keyword::Not,
            "TRUE" => Keyword::True,
            "FALSE" => Keyword::False,
            "NULL" => Keyword::Null,
            "GRAPH" => Keyword::Graph,
            "OUTBOUND" => Keyword::Outbound,
            "INBOUND" => Keyword::Inbound,
            "ANY" => Keyword::Any,
            "TYPE" => Keyword::Type,
            "SHORTEST_PATH" => Keyword::ShortestPath,
            "TO" => Keyword::To,
            "WEIGHT" => Keyword::Weight,
            "DEFAULT" => Keyword::Default,
            _ => return None,
        })
    }

    /// Keywords that may still be used as attribute names after a dot.
    pub fn spelling(self) -> &'static str {
        match self {
            Keyword::For => "for",
            Keyword::In => "in",
            Keyword::Filter => "filter",
            Keyword::Sort => "sort",
            Keyword::Limit => "limit",
            Keyword::Return => "return",
            Keyword::Let => "let",
            Keyword::Collect => "collect",
            Keyword::Aggregate => "aggregate",
            Keyword::Asc => "asc",
            Keyword::Desc => "desc",
            Keyword::And => "and",
            Keyword::Or => "or",
            Keyword::Xor => "xor",
            Keyword::Not => "not",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::Null => "null",
            Keyword::Graph => "graph",
            Keyword::Outbound => "outbound",
            Keyword::Inbound => "inbound",
            Keyword::Any => "any",
            Keyword::Type => "type",
            Keyword::ShortestPath => "shortest_path",
            Keyword::To => "to",
            Keyword::Weight => "weight",
            Keyword::Default => "default",
        }
    }
}

/// Token payload.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    /// Reserved word.
    Keyword(Keyword),
    /// Identifier, backticks removed.
    Ident(String),
    /// String literal, escapes resolved.
    Str(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `..`
    DotDot,
    /// `:`
    Colon,
    /// `=`
    Assign,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `!`
    Bang,
    /// `&&`
    AndAnd,
    /// `||`
    OrOr,
    /// End of input.
    Eof,
}

impl TokenKind {
    /// Spelling used in error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Keyword(kw) => kw.spelling().to_ascii_uppercase(),
            TokenKind::Ident(name) => name.clone(),
            TokenKind::Str(s) => format!("\"{s}\""),
            TokenKind::Int(v) => v.to_string(),
            TokenKind::Float(v) => v.to_string(),
            TokenKind::LParen => "(".into(),
            TokenKind::RParen => ")".into(),
            TokenKind::LBracket => "[".into(),
            TokenKind::RBracket => "]".into(),
            TokenKind::LBrace => "{".into(),
            TokenKind::RBrace => "}".into(),
            TokenKind::Comma => ",".into(),
            TokenKind::Dot => ".".into(),
            TokenKind::DotDot => "..".into(),
            TokenKind::Colon => ":".into(),
            TokenKind::Assign => "=".into(),
            TokenKind::EqEq => "==".into(),
            TokenKind::NotEq => "!=".into(),
            TokenKind::Lt => "<".into(),
            TokenKind::Le => "<=".into(),
            TokenKind::Gt => ">".into(),
            TokenKind::Ge => ">=".into(),
            TokenKind::Plus => "+".into(),
            TokenKind::Minus => "-".into(),
            TokenKind::Star => "*".into(),
            TokenKind::Slash => "/".into(),
            TokenKind::Percent => "%".into(),
            TokenKind::Bang => "!".into(),
            TokenKind::AndAnd => "&&".into(),
            TokenKind::OrOr => "||".into(),
            TokenKind::Eof => "end of input".into(),
        }
    }
}

/// Token with its starting position.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    /// Payload.
    pub kind: TokenKind,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
}

/// Splits query text into tokens, always ending with [`TokenKind::Eof`].
pub fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(input).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
            column: 1,
            tokens: Vec::new(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next()
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            if c == '/' && self.peek_second() == Some('/') {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }
            if c == '/' && self.peek_second() == Some('*') {
                self.skip_block_comment(line, column)?;
                continue;
            }
            if c.is_ascii_digit() {
                let kind = self.number(line, column)?;
                self.push(kind, line, column);
                continue;
            }
            if c == '_' || c.is_alphabetic() {
                let word = self.word();
                let kind = match Keyword::lookup(&word) {
                    Some(kw) => TokenKind::Keyword(kw),
                    None => TokenKind::Ident(word),
                };
                self.push(kind, line, column);
                continue;
            }
            if c == '`' {
                self.bump();
                let name = self.quoted('`', line, column)?;
                self.push(TokenKind::Ident(name), line, column);
                continue;
            }
            if c == '"' || c == '\'' {
                self.bump();
                let text = self.quoted(c, line, column)?;
                self.push(TokenKind::Str(text), line, column);
                continue;
            }
            let kind = self.symbol(c, line, column)?;
            self.push(kind, line, column);
        }
        let (line, column) = (self.line, self.column);
        self.push(TokenKind::Eof, line, column);
        Ok(self.tokens)
    }

    fn skip_block_comment(&mut self, line: usize, column: usize) -> Result<(), SyntaxError> {
        self.bump();
        self.bump();
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(SyntaxError::new("unterminated comment", line, column)),
            }
        }
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn number(&mut self, line: usize, column: usize) -> Result<TokenKind, SyntaxError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.'
                && !is_float
                && self.peek_second().is_some_and(|next| next.is_ascii_digit())
            {
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E') && !text.contains(['e', 'E']) {
                let mut ahead = self.chars.clone();
                ahead.next();
                let next = ahead.next();
                let exp_ok = match next {
                    Some('+') | Some('-') => ahead.next().is_some_and(|d| d.is_ascii_digit()),
                    Some(d) => d.is_ascii_digit(),
                    None => false,
                };
                if !exp_ok {
                    break;
                }
                is_float = true;
                text.push(c);
                self.bump();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.bump();
                }
            } else {
                break;
            }
        }
        if let Some(c) = self.peek() {
            if c == '_' || c.is_alphabetic() {
                return Err(SyntaxError::new(
                    format!("invalid numeric literal '{text}{c}'"),
                    line,
                    column,
                ));
            }
        }
        // str::parse is locale independent.
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| SyntaxError::new(format!("invalid number '{text}'"), line, column))
        } else {
            match text.parse::<i64>() {
                Ok(v) => Ok(TokenKind::Int(v)),
                Err(_) => text.parse::<f64>().map(TokenKind::Float).map_err(|_| {
                    SyntaxError::new(format!("invalid number '{text}'"), line, column)
                }),
            }
        }
    }

    fn quoted(&mut self, quote: char, line: usize, column: usize) -> Result<String, SyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(SyntaxError::new("unterminated string literal", line, column));
                }
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = self.bump().ok_or_else(|| {
                        SyntaxError::new("unterminated string literal", line, column)
                    })?;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        '\'' => out.push('\''),
                        '`' => out.push('`'),
                        'u' => out.push(self.unicode_escape(line, column)?),
                        other => {
                            return Err(SyntaxError::new(
                                format!("unknown escape sequence '\\{other}'"),
                                self.line,
                                self.column.saturating_sub(2),
                            ));
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn unicode_escape(&mut self, line: usize, column: usize) -> Result<char, SyntaxError> {
        let mut hex = String::with_capacity(4);
        for _ in 0..4 {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                _ => return Err(SyntaxError::new("invalid \\u escape", line, column)),
            }
        }
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| SyntaxError::new("invalid \\u escape", line, column))
    }

    fn symbol(&mut self, c: char, line: usize, column: usize) -> Result<TokenKind, SyntaxError> {
        self.bump();
        let next = self.peek();
        let two = |lexer: &mut Self, kind: TokenKind| -> Result<TokenKind, SyntaxError> {
            lexer.bump();
            Ok(kind)
        };
        match (c, next) {
            ('=', Some('=')) => two(self, TokenKind::EqEq),
            ('!', Some('=')) => two(self, TokenKind::NotEq),
            ('<', Some('=')) => two(self, TokenKind::Le),
            ('>', Some('=')) => two(self, TokenKind::Ge),
            ('&', Some('&')) => two(self, TokenKind::AndAnd),
            ('|', Some('|')) => two(self, TokenKind::OrOr),
            ('.', Some('.')) => two(self, TokenKind::DotDot),
            ('=', _) => Ok(TokenKind::Assign),
            ('!', _) => Ok(TokenKind::Bang),
            ('<', _) => Ok(TokenKind::Lt),
            ('>', _) => Ok(TokenKind::Gt),
            ('.', _) => Ok(TokenKind::Dot),
            ('(', _) => Ok(TokenKind::LParen),
            (')', _) => Ok(TokenKind::RParen),
            ('[', _) => Ok(TokenKind::LBracket),
            (']', _) => Ok(TokenKind::RBracket),
            ('{', _) => Ok(TokenKind::LBrace),
            ('}', _) => Ok(TokenKind::RBrace),
            (',', _) => Ok(TokenKind::Comma),
            (':', _) => Ok(TokenKind::Colon),
            ('+', _) => Ok(TokenKind::Plus),
            ('-', _) => Ok(TokenKind::Minus),
            ('*', _) => Ok(TokenKind::Star),
            ('/', _) => Ok(TokenKind::Slash),
            ('%', _) => Ok(TokenKind::Percent),
            (other, _) => Err(SyntaxError::new(
                format!("unexpected character '{other}'"),
                line,
                column,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn range_dots_do_not_become_floats() {
        assert_eq!(
            kinds("1..3"),
            vec![
                TokenKind::Int(1),
                TokenKind::DotDot,
                TokenKind::Int(3),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("2.5"), vec![TokenKind::Float(2.5), TokenKind::Eof]);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            kinds("for Filter RETURN"),
            vec![
                TokenKind::Keyword(Keyword::For),
                TokenKind::Keyword(Keyword::Filter),
                TokenKind::Keyword(Keyword::Return),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tracks_line_and_column() {
        let tokens = tokenize("FOR d\n  IN users").expect("tokenize");
        let users = &tokens[3];
        assert_eq!(users.kind, TokenKind::Ident("users".into()));
        assert_eq!((users.line, users.column), (2, 6));
    }

    #[test]
    fn reports_unknown_characters_with_position() {
        let err = tokenize("FOR d IN users\nFILTER d.a # 1").expect_err("bad char");
        assert_eq!((err.line, err.column), (2, 12));
    }

    #[test]
    fn unterminated_string_is_located_at_its_quote() {
        let err = tokenize("RETURN \"abc").expect_err("unterminated");
        assert_eq!((err.line, err.column), (1, 8));
    }
}
