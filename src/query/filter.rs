//! `$filter` grammar: tokenizer and recursive-descent parser producing a boolean expression tree.

use crate::error::AppError;
use crate::store::looks_like_guid;

#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Compare {
        left: Operand,
        operator: CompareOp,
        right: Operand,
    },
    In {
        left: Operand,
        values: Vec<Operand>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn parse(word: &str) -> Option<CompareOp> {
        match word.to_ascii_lowercase().as_str() {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            _ => None,
        }
    }
}

impl Default for CompareOp {
    fn default() -> Self {
        CompareOp::Eq
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    /// Unquoted token: number, date, time, bare GUID.
    Raw(String),
    /// Quoted string with `''` escapes already resolved.
    String(String),
    /// Prefixed literal such as `guid'...'` or `datetime'...'`.
    Typed { prefix: String, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LambdaKind {
    Any,
    All,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Lambda {
    /// Path of the collection-valued property.
    pub collection: String,
    pub kind: LambdaKind,
    pub variable: String,
    /// Inner identifiers are rewritten relative to the lambda variable; the empty path is the item itself.
    pub predicate: Option<FilterExpr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Property(String),
    Literal(Literal),
    Call { function: String, args: Vec<Operand> },
    Lambda(Box<Lambda>),
}

impl Operand {
    /// Property paths referenced by this operand, including function arguments and lambda collections.
    pub fn referenced_paths(&self, out: &mut Vec<String>) {
        match self {
            Operand::Property(p) => out.push(p.clone()),
            Operand::Call { args, .. } => args.iter().for_each(|a| a.referenced_paths(out)),
            Operand::Lambda(l) => out.push(l.collection.clone()),
            Operand::Literal(_) => {}
        }
    }
}

impl FilterExpr {
    /// Top-level property paths the expression reads.
    pub fn referenced_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        match self {
            FilterExpr::And(items) | FilterExpr::Or(items) => items.iter().for_each(|i| i.collect_paths(out)),
            FilterExpr::Not(inner) => inner.collect_paths(out),
            FilterExpr::Compare { left, right, .. } => {
                left.referenced_paths(out);
                right.referenced_paths(out);
            }
            FilterExpr::In { left, .. } => left.referenced_paths(out),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Colon,
    Str(String),
    Typed(String, String),
    Word(String),
}

fn is_literal_word(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-') | Some('+') | Some('.') => chars.next().map(|c| c.is_ascii_digit()).unwrap_or(false),
        _ => looks_like_guid(word),
    }
}

fn is_identifier(chars: &[char]) -> bool {
    matches!(chars.first(), Some(c) if c.is_alphabetic() || *c == '_')
        && chars.iter().all(|c| c.is_alphanumeric() || *c == '_')
}

fn read_quoted(chars: &[char], mut i: usize) -> Result<(String, usize), AppError> {
    // chars[i] is the opening quote
    let mut out = String::new();
    i += 1;
    loop {
        match chars.get(i) {
            None => return Err(AppError::BadRequest("unterminated string literal in $filter".into())),
            Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                out.push('\'');
                i += 2;
            }
            Some('\'') => return Ok((out, i + 1)),
            Some(c) => {
                out.push(*c);
                i += 1;
            }
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, AppError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '\'' => {
                let (s, next) = read_quoted(&chars, i)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            _ => {
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() && !"(),'".contains(chars[i]) {
                    // `i:` ends a lambda variable; times such as `12:00:00` keep their colons
                    if chars[i] == ':' && is_identifier(&chars[start..i]) {
                        break;
                    }
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if i < chars.len() && chars[i] == '\'' && word.chars().all(|c| c.is_ascii_alphabetic()) {
                    let (s, next) = read_quoted(&chars, i)?;
                    tokens.push(Token::Typed(word.to_ascii_lowercase(), s));
                    i = next;
                } else {
                    tokens.push(Token::Word(word));
                }
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    lambda_vars: Vec<String>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, expected: Token) -> Result<(), AppError> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(AppError::BadRequest(format!(
                "invalid $filter: expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr, AppError> {
        let mut items = vec![self.parse_and()?];
        while self.peek_keyword("or") {
            self.next();
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { FilterExpr::Or(items) })
    }

    fn parse_and(&mut self) -> Result<FilterExpr, AppError> {
        let mut items = vec![self.parse_unary()?];
        while self.peek_keyword("and") {
            self.next();
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { FilterExpr::And(items) })
    }

    fn parse_unary(&mut self) -> Result<FilterExpr, AppError> {
        if self.peek_keyword("not") {
            self.next();
            return Ok(FilterExpr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<FilterExpr, AppError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        let left = self.parse_operand()?;
        if let Some(Token::Word(w)) = self.peek() {
            if let Some(operator) = CompareOp::parse(w) {
                self.next();
                let right = self.parse_operand()?;
                return Ok(FilterExpr::Compare { left, operator, right });
            }
            if w.eq_ignore_ascii_case("in") {
                self.next();
                self.expect(Token::LParen)?;
                let mut values = Vec::new();
                while self.peek() != Some(&Token::RParen) {
                    values.push(self.parse_operand()?);
                    if self.peek() == Some(&Token::Comma) {
                        self.next();
                    }
                    if self.peek().is_none() {
                        return Err(AppError::BadRequest("invalid $filter: unterminated in list".into()));
                    }
                }
                self.next();
                return Ok(FilterExpr::In { left, values });
            }
        }
        Ok(FilterExpr::Compare {
            left,
            operator: CompareOp::Eq,
            right: Operand::Literal(Literal::Bool(true)),
        })
    }

    fn parse_operand(&mut self) -> Result<Operand, AppError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Literal(Literal::String(s))),
            Some(Token::Typed(prefix, value)) => Ok(Operand::Literal(Literal::Typed { prefix, value })),
            Some(Token::Word(w)) => self.parse_word(w),
            other => Err(AppError::BadRequest(format!("invalid $filter: unexpected {:?}", other))),
        }
    }

    fn parse_word(&mut self, word: String) -> Result<Operand, AppError> {
        match word.to_ascii_lowercase().as_str() {
            "true" => return Ok(Operand::Literal(Literal::Bool(true))),
            "false" => return Ok(Operand::Literal(Literal::Bool(false))),
            "null" => return Ok(Operand::Literal(Literal::Null)),
            _ => {}
        }
        if is_literal_word(&word) {
            return Ok(Operand::Literal(Literal::Raw(word)));
        }
        if self.peek() != Some(&Token::LParen) {
            return Ok(Operand::Property(self.relative_path(&word)));
        }
        let lower = word.to_ascii_lowercase();
        if lower.ends_with("/any") || lower.ends_with("/all") {
            let kind = if lower.ends_with("/any") { LambdaKind::Any } else { LambdaKind::All };
            let collection = self.relative_path(&word[..word.len() - 4]);
            self.expect(Token::LParen)?;
            if self.peek() == Some(&Token::RParen) {
                self.next();
                return Ok(Operand::Lambda(Box::new(Lambda {
                    collection,
                    kind,
                    variable: String::new(),
                    predicate: None,
                })));
            }
            let variable = match self.next() {
                Some(Token::Word(v)) => v,
                other => {
                    return Err(AppError::BadRequest(format!(
                        "invalid $filter: expected lambda variable, found {:?}",
                        other
                    )))
                }
            };
            self.expect(Token::Colon)?;
            self.lambda_vars.push(variable.clone());
            let predicate = self.parse_or();
            self.lambda_vars.pop();
            let predicate = predicate?;
            self.expect(Token::RParen)?;
            return Ok(Operand::Lambda(Box::new(Lambda {
                collection,
                kind,
                variable,
                predicate: Some(predicate),
            })));
        }
        self.next();
        let mut args = Vec::new();
        while self.peek() != Some(&Token::RParen) {
            args.push(self.parse_operand()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.next();
                }
                Some(Token::RParen) => {}
                other => {
                    return Err(AppError::BadRequest(format!(
                        "invalid $filter: unexpected {:?} in arguments of {}",
                        other, word
                    )))
                }
            }
        }
        self.next();
        Ok(Operand::Call { function: lower, args })
    }

    /// Strip the innermost lambda variable from a path.
    fn relative_path(&self, path: &str) -> String {
        if let Some(var) = self.lambda_vars.last() {
            if path == var {
                return String::new();
            }
            if let Some(rest) = path.strip_prefix(var.as_str()).and_then(|r| r.strip_prefix('/')) {
                return rest.to_string();
            }
        }
        path.strip_prefix("$it/").unwrap_or(path).to_string()
    }
}

/// Parse a decoded `$filter` value.
pub fn parse_filter(input: &str) -> Result<FilterExpr, AppError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(AppError::BadRequest("empty $filter".into()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        lambda_vars: Vec::new(),
    };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(AppError::BadRequest(format!(
            "invalid $filter: trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}
