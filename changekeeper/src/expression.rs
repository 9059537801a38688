//! Label and context expressions.
//!
//! Both filters share one small boolean grammar:
//!
//! ```text
//! expr    := and (("or" | ",") and)*
//! and     := unary ("and" unary)*
//! unary   := ("!" | "not") unary | "(" expr ")" | name
//! ```
//!
//! Names are matched case-insensitively. An empty expression matches everything.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Name(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, names: &BTreeSet<String>) -> bool {
        match self {
            Node::Name(name) => names.contains(name),
            Node::Not(inner) => !inner.eval(names),
            Node::And(a, b) => a.eval(names) && b.eval(names),
            Node::Or(a, b) => a.eval(names) || b.eval(names),
        }
    }
}

/// A parsed label or context expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expression {
    source: String,
    root: Option<Node>,
}

impl Expression {
    /// The expression that matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Ok(Self::any());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(format!(
                "unexpected '{}' in expression '{}'",
                token,
                source.trim()
            ));
        }
        Ok(Self {
            source: source.trim().to_string(),
            root: Some(root),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against a set of names. Names are compared lowercased.
    pub fn matches<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match &self.root {
            None => true,
            Some(root) => {
                let names = names
                    .into_iter()
                    .map(|n| n.as_ref().trim().to_lowercase())
                    .collect::<BTreeSet<_>>();
                root.eval(&names)
            }
        }
    }
}

impl FromStr for Expression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(name) => f.write_str(name),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("and"),
            Token::Or => f.write_str("or"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Or);
            }
            c if is_name_char(c) => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(match word.to_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    lower => Token::Name(lower.to_string()),
                });
            }
            other => {
                return Err(format!(
                    "unexpected character '{}' in expression '{}'",
                    other,
                    source.trim()
                ))
            }
        }
    }
    Ok(tokens)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/' | '$')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Node, String> {
        let mut node = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            node = Node::Or(Box::new(node), Box::new(self.and()?));
        }
        Ok(node)
    }

    fn and(&mut self) -> Result<Node, String> {
        let mut node = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            node = Node::And(Box::new(node), Box::new(self.unary()?));
        }
        Ok(node)
    }

    fn unary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Not) => Ok(Node::Not(Box::new(self.unary()?))),
            Some(Token::Open) => {
                let node = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(node),
                    _ => Err("missing closing ')' in expression".to_string()),
                }
            }
            Some(Token::Name(name)) => Ok(Node::Name(name)),
            Some(token) => Err(format!("expected a name, found '{}'", token)),
            None => Err("expression ended unexpectedly".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str, names: &[&str]) -> bool {
        Expression::parse(expr).unwrap().matches(names.iter())
    }

    #[test]
    fn empty_matches_everything() {
        assert!(eval("", &[]));
        assert!(eval("   ", &["base"]));
        assert!(Expression::any().is_empty());
    }

    #[test]
    fn single_name() {
        assert!(eval("base", &["base", "extra"]));
        assert!(!eval("base", &["extra"]));
        assert!(!eval("base", &[]));
    }

    #[test]
    fn names_are_case_insensitive() {
        assert!(eval("Base", &["BASE"]));
    }

    #[test]
    fn comma_means_or() {
        assert!(eval("base, extra", &["extra"]));
        assert!(!eval("base,extra", &["other"]));
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        // a or (b and c)
        assert!(eval("a or b and c", &["a"]));
        assert!(!eval("a or b and c", &["b"]));
        assert!(eval("(a or b) and c", &["b", "c"]));
        assert!(!eval("(a or b) and c", &["b"]));
    }

    #[test]
    fn negation() {
        assert!(eval("!test", &["prod"]));
        assert!(!eval("!test", &["test"]));
        assert!(eval("not test and prod", &["prod"]));
        assert!(eval("!(a and b)", &["a"]));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(Expression::parse("a and").is_err());
        assert!(Expression::parse("(a or b").is_err());
        assert!(Expression::parse("a b").is_err());
        assert!(Expression::parse("a & b").is_err());
        assert!(Expression::parse(")").is_err());
    }

    #[test]
    fn keeps_source_text() {
        let expr: Expression = " base and !slow ".parse().unwrap();
        assert_eq!(expr.as_str(), "base and !slow");
        assert_eq!(expr.to_string(), "base and !slow");
    }
}
