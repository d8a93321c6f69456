//! Tokenizer and recursive-descent parser for the restricted expression
//! grammar.
//!
//! Precedence, loosest first: `||`, `&&`, `==`/`!=`, `!`, primary. The
//! GitHub Actions ternary idiom `cond && a || b` falls out of `&&` binding
//! tighter than `||`.

use crate::ExprError;

/// Binary operators in the safe subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    And,
    Or,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Single-quoted string literal, unescaped (`''` -> `'`).
    StringLit(String),
    /// Numeric literal, kept verbatim to avoid float reformatting.
    NumberLit(String),
    BoolLit(bool),
    Null,
    /// Dotted context path, e.g. `["needs", "agent", "outputs", "text"]`.
    Context(Vec<String>),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    StringLit(String),
    NumberLit(String),
    Dot,
    Star,
    Bang,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    LParen,
    RParen,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn next_token(&mut self) -> Result<Option<(Token, usize)>, ExprError> {
        self.skip_ws();
        let start = self.pos;
        let rest = self.rest();
        let Some(first) = rest.chars().next() else {
            return Ok(None);
        };

        let token = match first {
            '.' => {
                self.pos += 1;
                Token::Dot
            }
            '*' => {
                self.pos += 1;
                Token::Star
            }
            '(' => {
                self.pos += 1;
                Token::LParen
            }
            ')' => {
                self.pos += 1;
                Token::RParen
            }
            '!' => {
                if rest.starts_with("!=") {
                    self.pos += 2;
                    Token::NotEq
                } else {
                    self.pos += 1;
                    Token::Bang
                }
            }
            '=' => {
                if rest.starts_with("==") {
                    self.pos += 2;
                    Token::EqEq
                } else {
                    return Err(ExprError::unsafe_at("assignment is not allowed", start));
                }
            }
            '&' => {
                if rest.starts_with("&&") {
                    self.pos += 2;
                    Token::AndAnd
                } else {
                    return Err(ExprError::unsafe_at("unrecognized token `&`", start));
                }
            }
            '|' => {
                if rest.starts_with("||") {
                    self.pos += 2;
                    Token::OrOr
                } else {
                    return Err(ExprError::unsafe_at("unrecognized token `|`", start));
                }
            }
            '\'' => {
                let mut value = String::new();
                let mut chars = rest[1..].char_indices();
                let mut end = None;
                while let Some((idx, c)) = chars.next() {
                    if c == '\'' {
                        // `''` is an escaped quote inside the literal.
                        if rest[1 + idx + 1..].starts_with('\'') {
                            value.push('\'');
                            chars.next();
                            continue;
                        }
                        end = Some(1 + idx + 1);
                        break;
                    }
                    value.push(c);
                }
                match end {
                    Some(len) => {
                        self.pos += len;
                        Token::StringLit(value)
                    }
                    None => {
                        return Err(ExprError::unsafe_at("unterminated string literal", start));
                    }
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut len = c.len_utf8();
                for ch in rest[len..].chars() {
                    if ch.is_ascii_digit() || ch == '.' {
                        len += ch.len_utf8();
                    } else {
                        break;
                    }
                }
                let text = &rest[..len];
                if text == "-" {
                    return Err(ExprError::unsafe_at("arithmetic is not allowed", start));
                }
                self.pos += len;
                Token::NumberLit(text.to_string())
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut len = 0;
                for ch in rest.chars() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                        len += ch.len_utf8();
                    } else {
                        break;
                    }
                }
                self.pos += len;
                Token::Ident(rest[..len].to_string())
            }
            other => {
                return Err(ExprError::unsafe_at(
                    format!("unrecognized token `{other}`"),
                    start,
                ));
            }
        };

        Ok(Some((token, start)))
    }
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let mut lexer = Lexer::new(src);
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next_token()? {
        tokens.push(tok);
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    src_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, o)| *o)
            .unwrap_or(self.src_len)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.bump();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_unary()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.bump() {
            Some(Token::StringLit(s)) => Ok(Expr::StringLit(s)),
            Some(Token::NumberLit(n)) => Ok(Expr::NumberLit(n)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::unsafe_at("unbalanced parenthesis", offset)),
                }
            }
            Some(Token::Ident(first)) => {
                // A call would be `ident(`: reject before treating as a path.
                if matches!(self.peek(), Some(Token::LParen)) {
                    return Err(ExprError::unsafe_at(
                        format!("function calls are not allowed (`{first}`)"),
                        offset,
                    ));
                }
                match first.as_str() {
                    "true" => return Ok(Expr::BoolLit(true)),
                    "false" => return Ok(Expr::BoolLit(false)),
                    "null" => return Ok(Expr::Null),
                    _ => {}
                }
                let mut segments = vec![first];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(seg)) => segments.push(seg),
                        Some(Token::Star) => segments.push("*".to_string()),
                        _ => {
                            return Err(ExprError::unsafe_at(
                                "expected property name after `.`",
                                offset,
                            ));
                        }
                    }
                }
                Ok(Expr::Context(segments))
            }
            Some(other) => Err(ExprError::unsafe_at(
                format!("unexpected token {other:?}"),
                offset,
            )),
            None => Err(ExprError::unsafe_at("empty expression", offset)),
        }
    }
}

/// Parse one expression (the inside of a `${{ ... }}` span).
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let src_len = src.len();
    let mut parser = Parser {
        tokens,
        pos: 0,
        src_len,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        let offset = parser.offset();
        return Err(ExprError::unsafe_at("trailing tokens", offset));
    }
    Ok(expr)
}
