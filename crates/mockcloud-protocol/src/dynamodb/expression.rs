// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key condition and update expression parsing.
//!
//! Supported grammar (top-level attribute paths only):
//!
//! ```text
//! key-condition := term [AND term]
//! term          := path op value
//!                | path BETWEEN value AND value
//!                | begins_with ( path , value )
//! op            := = | < | <= | > | >=
//!
//! update        := clause+
//! clause        := SET assign {, assign}
//!                | REMOVE path {, path}
//!                | ADD path value {, path value}
//! assign        := path = operand [(+ | -) operand]
//! operand       := path | value | if_not_exists ( path , value )
//! ```
//!
//! `#name` placeholders resolve through `ExpressionAttributeNames` and
//! `:value` placeholders through `ExpressionAttributeValues`.

use std::collections::BTreeMap;

use super::{AttributeValue, Item};
use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Value(String),
    Op(String),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' | '+' | '-' => {
                chars.next();
                tokens.push(Token::Op(ch.to_string()));
            }
            '<' | '>' => {
                chars.next();
                let mut op = ch.to_string();
                if chars.peek() == Some(&'=') || (ch == '<' && chars.peek() == Some(&'>')) {
                    if let Some(next) = chars.next() {
                        op.push(next);
                    }
                }
                tokens.push(Token::Op(op));
            }
            ':' => {
                chars.next();
                let name = take_word(&mut chars);
                if name.is_empty() {
                    return Err(ProtocolError::InvalidExpression(
                        "empty value placeholder".into(),
                    ));
                }
                tokens.push(Token::Value(format!(":{name}")));
            }
            c if c == '#' || c == '_' || c.is_alphanumeric() => {
                let mut word = String::new();
                if c == '#' {
                    chars.next();
                    word.push('#');
                }
                word.push_str(&take_word(&mut chars));
                tokens.push(Token::Ident(word));
            }
            other => {
                return Err(ProtocolError::InvalidExpression(format!(
                    "unexpected character '{other}'"
                )));
            }
        }
    }
    Ok(tokens)
}

fn take_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '_' || c == '.' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    names: &'a BTreeMap<String, String>,
    values: &'a Item,
}

impl<'a> Parser<'a> {
    fn new(
        input: &str,
        names: &'a BTreeMap<String, String>,
        values: &'a Item,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
            names,
            values,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, expected: Token) -> Result<(), ProtocolError> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(ProtocolError::InvalidExpression(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ProtocolError> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ProtocolError::InvalidExpression(format!(
                "expected {keyword}"
            )))
        }
    }

    fn path(&mut self) -> Result<String, ProtocolError> {
        match self.next() {
            Some(Token::Ident(word)) if word.starts_with('#') => self
                .names
                .get(&word)
                .cloned()
                .ok_or_else(|| {
                    ProtocolError::InvalidExpression(format!(
                        "undefined attribute name placeholder {word}"
                    ))
                }),
            Some(Token::Ident(word)) => Ok(word),
            other => Err(ProtocolError::InvalidExpression(format!(
                "expected attribute name, found {other:?}"
            ))),
        }
    }

    fn value(&mut self) -> Result<AttributeValue, ProtocolError> {
        match self.next() {
            Some(Token::Value(placeholder)) => {
                self.values.get(&placeholder).cloned().ok_or_else(|| {
                    ProtocolError::InvalidExpression(format!(
                        "undefined attribute value placeholder {placeholder}"
                    ))
                })
            }
            other => Err(ProtocolError::InvalidExpression(format!(
                "expected value placeholder, found {other:?}"
            ))),
        }
    }
}

/// Comparison applied to one key attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOp {
    Eq(AttributeValue),
    Lt(AttributeValue),
    Le(AttributeValue),
    Gt(AttributeValue),
    Ge(AttributeValue),
    BeginsWith(AttributeValue),
    Between(AttributeValue, AttributeValue),
}

impl KeyOp {
    pub fn matches(&self, candidate: &AttributeValue) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Eq(v) => candidate.compare(v) == Some(Equal),
            Self::Lt(v) => candidate.compare(v) == Some(Less),
            Self::Le(v) => matches!(candidate.compare(v), Some(Less | Equal)),
            Self::Gt(v) => candidate.compare(v) == Some(Greater),
            Self::Ge(v) => matches!(candidate.compare(v), Some(Greater | Equal)),
            Self::BeginsWith(v) => candidate.begins_with(v),
            Self::Between(lo, hi) => {
                matches!(candidate.compare(lo), Some(Greater | Equal))
                    && matches!(candidate.compare(hi), Some(Less | Equal))
            }
        }
    }
}

/// One `attribute op value` term of a key condition.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTerm {
    pub attribute: String,
    pub op: KeyOp,
}

/// Parse a `KeyConditionExpression` into its (one or two) terms.
pub fn parse_key_condition(
    expression: &str,
    names: &BTreeMap<String, String>,
    values: &Item,
) -> Result<Vec<KeyTerm>, ProtocolError> {
    let mut parser = Parser::new(expression, names, values)?;
    let mut terms = vec![key_term(&mut parser)?];
    if parser.peek_keyword("AND") {
        parser.pos += 1;
        terms.push(key_term(&mut parser)?);
    }
    if !parser.at_end() {
        return Err(ProtocolError::InvalidExpression(
            "unexpected trailing tokens in key condition".into(),
        ));
    }
    Ok(terms)
}

fn key_term(parser: &mut Parser<'_>) -> Result<KeyTerm, ProtocolError> {
    if parser.peek_keyword("begins_with") {
        parser.pos += 1;
        parser.expect(Token::LParen)?;
        let attribute = parser.path()?;
        parser.expect(Token::Comma)?;
        let value = parser.value()?;
        parser.expect(Token::RParen)?;
        return Ok(KeyTerm {
            attribute,
            op: KeyOp::BeginsWith(value),
        });
    }

    let attribute = parser.path()?;
    if parser.peek_keyword("BETWEEN") {
        parser.pos += 1;
        let lo = parser.value()?;
        parser.expect_keyword("AND")?;
        let hi = parser.value()?;
        return Ok(KeyTerm {
            attribute,
            op: KeyOp::Between(lo, hi),
        });
    }

    let op = match parser.next() {
        Some(Token::Op(op)) => op,
        other => {
            return Err(ProtocolError::InvalidExpression(format!(
                "expected comparison operator, found {other:?}"
            )));
        }
    };
    let value = parser.value()?;
    let op = match op.as_str() {
        "=" => KeyOp::Eq(value),
        "<" => KeyOp::Lt(value),
        "<=" => KeyOp::Le(value),
        ">" => KeyOp::Gt(value),
        ">=" => KeyOp::Ge(value),
        other => {
            return Err(ProtocolError::InvalidExpression(format!(
                "operator {other} is not allowed in a key condition"
            )));
        }
    };
    Ok(KeyTerm { attribute, op })
}

/// Right-hand side operand of a SET assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(AttributeValue),
    Path(String),
    IfNotExists(String, AttributeValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Operand(Operand),
    Plus(Operand, Operand),
    Minus(Operand, Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    Set { path: String, value: SetValue },
    Remove { path: String },
    Add { path: String, value: AttributeValue },
}

/// Parse an `UpdateExpression`.
pub fn parse_update(
    expression: &str,
    names: &BTreeMap<String, String>,
    values: &Item,
) -> Result<Vec<UpdateAction>, ProtocolError> {
    let mut parser = Parser::new(expression, names, values)?;
    let mut actions = Vec::new();
    while !parser.at_end() {
        let clause = match parser.next() {
            Some(Token::Ident(word)) => word.to_ascii_uppercase(),
            other => {
                return Err(ProtocolError::InvalidExpression(format!(
                    "expected SET, REMOVE or ADD, found {other:?}"
                )));
            }
        };
        loop {
            match clause.as_str() {
                "SET" => {
                    let path = parser.path()?;
                    parser.expect(Token::Op("=".into()))?;
                    let first = operand(&mut parser)?;
                    let value = match parser.peek() {
                        Some(Token::Op(op)) if op == "+" => {
                            parser.pos += 1;
                            SetValue::Plus(first, operand(&mut parser)?)
                        }
                        Some(Token::Op(op)) if op == "-" => {
                            parser.pos += 1;
                            SetValue::Minus(first, operand(&mut parser)?)
                        }
                        _ => SetValue::Operand(first),
                    };
                    actions.push(UpdateAction::Set { path, value });
                }
                "REMOVE" => {
                    let path = parser.path()?;
                    actions.push(UpdateAction::Remove { path });
                }
                "ADD" => {
                    let path = parser.path()?;
                    let value = parser.value()?;
                    actions.push(UpdateAction::Add { path, value });
                }
                other => {
                    return Err(ProtocolError::InvalidExpression(format!(
                        "unsupported update clause {other}"
                    )));
                }
            }
            if parser.peek() == Some(&Token::Comma) {
                parser.pos += 1;
            } else {
                break;
            }
        }
    }
    if actions.is_empty() {
        return Err(ProtocolError::InvalidExpression(
            "update expression is empty".into(),
        ));
    }
    Ok(actions)
}

fn operand(parser: &mut Parser<'_>) -> Result<Operand, ProtocolError> {
    match parser.peek() {
        Some(Token::Value(_)) => Ok(Operand::Value(parser.value()?)),
        Some(Token::Ident(word)) if word.eq_ignore_ascii_case("if_not_exists") => {
            parser.pos += 1;
            parser.expect(Token::LParen)?;
            let path = parser.path()?;
            parser.expect(Token::Comma)?;
            let value = parser.value()?;
            parser.expect(Token::RParen)?;
            Ok(Operand::IfNotExists(path, value))
        }
        _ => Ok(Operand::Path(parser.path()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, AttributeValue)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_partition_only() {
        let vals = values(&[(":pk", AttributeValue::S("u1".into()))]);
        let terms = parse_key_condition("user_id = :pk", &BTreeMap::new(), &vals).unwrap();
        assert_eq!(
            terms,
            vec![KeyTerm {
                attribute: "user_id".into(),
                op: KeyOp::Eq(AttributeValue::S("u1".into())),
            }]
        );
    }

    #[test]
    fn test_between_uses_inner_and() {
        let vals = values(&[
            (":pk", AttributeValue::S("u1".into())),
            (":lo", AttributeValue::N("1".into())),
            (":hi", AttributeValue::N("5".into())),
        ]);
        let names = BTreeMap::from([("#ts".to_string(), "created".to_string())]);
        let terms =
            parse_key_condition("user_id = :pk AND #ts BETWEEN :lo AND :hi", &names, &vals).unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1].attribute, "created");
        assert!(terms[1].op.matches(&AttributeValue::N("3".into())));
        assert!(!terms[1].op.matches(&AttributeValue::N("6".into())));
    }

    #[test]
    fn test_begins_with_term() {
        let vals = values(&[
            (":pk", AttributeValue::S("u1".into())),
            (":p", AttributeValue::S("order#".into())),
        ]);
        let terms =
            parse_key_condition("user_id = :pk and begins_with(sk, :p)", &BTreeMap::new(), &vals)
                .unwrap();
        assert!(terms[1].op.matches(&AttributeValue::S("order#1".into())));
    }

    #[test]
    fn test_undefined_placeholder() {
        let err = parse_key_condition("id = :missing", &BTreeMap::new(), &Item::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidExpression(_)));
    }

    #[test]
    fn test_update_expression_clauses() {
        let vals = values(&[
            (":name", AttributeValue::S("Ada".into())),
            (":one", AttributeValue::N("1".into())),
        ]);
        let actions = parse_update(
            "SET #n = :name, visits = if_not_exists(visits, :one) + :one REMOVE legacy ADD score :one",
            &BTreeMap::from([("#n".to_string(), "name".to_string())]),
            &vals,
        )
        .unwrap();
        assert_eq!(actions.len(), 4);
        assert_eq!(
            actions[0],
            UpdateAction::Set {
                path: "name".into(),
                value: SetValue::Operand(Operand::Value(AttributeValue::S("Ada".into()))),
            }
        );
        assert!(matches!(actions[1], UpdateAction::Set { value: SetValue::Plus(Operand::IfNotExists(..), _), .. }));
        assert_eq!(actions[2], UpdateAction::Remove { path: "legacy".into() });
        assert!(matches!(actions[3], UpdateAction::Add { .. }));
    }

    #[test]
    fn test_update_rejects_unknown_clause() {
        assert!(parse_update("DELETE tags :t", &BTreeMap::new(), &Item::new()).is_err());
        assert!(parse_update("", &BTreeMap::new(), &Item::new()).is_err());
    }
}
