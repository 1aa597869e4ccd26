//! Variable substitution.
//!
//! String values may reference variables with `${name.path}`. Alternatives
//! are separated by `|` and tried left to right; a quoted alternative
//! (`'text'` or `"text"`) is a constant. `$${` escapes a literal `${`.
//! When a string consists of exactly one reference, the referenced node is
//! substituted as-is, so a variable can expand into a list or a dict.

use super::ast::{Ast, Dict, Node, Processors};
use super::{TranspilerError, TranspilerResult};

/// One immutable binding context for substitution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vars {
    tree: Ast,
    processors_key: Option<String>,
    processors: Option<Processors>,
}

impl Vars {
    pub fn new(tree: Ast) -> Self {
        Self {
            tree,
            processors_key: None,
            processors: None,
        }
    }

    /// Vars whose `processors` are attached to any substitution made from
    /// variables under `processors_key`.
    pub fn with_processors(
        tree: Ast,
        processors_key: impl Into<String>,
        processors: Processors,
    ) -> Self {
        Self {
            tree,
            processors_key: Some(processors_key.into()),
            processors: Some(processors),
        }
    }

    pub fn tree(&self) -> &Ast {
        &self.tree
    }

    pub fn lookup(&self, name: &str) -> Option<&Node> {
        self.tree.lookup(name)
    }

    fn processors_for(&self, name: &str) -> Option<&Processors> {
        let key = self.processors_key.as_deref()?;
        let matches = name == key
            || name
                .strip_prefix(key)
                .is_some_and(|rest| rest.starts_with('.'));
        if matches {
            self.processors.as_ref()
        } else {
            None
        }
    }

    /// Substitute every reference in `value`.
    ///
    /// Returns [`TranspilerError::Unresolved`] when a reference has no
    /// alternative that resolves. The first processors attached to a used
    /// variable are stored into `processors`.
    pub fn replace(
        &self,
        value: &str,
        processors: &mut Option<Processors>,
    ) -> TranspilerResult<Node> {
        let tokens = tokenize(value)?;
        if let [Token::Reference(alternatives)] = tokens.as_slice() {
            let node = self.resolve(value, alternatives, processors)?;
            return Ok(node);
        }

        let mut out = String::with_capacity(value.len());
        for token in &tokens {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Reference(alternatives) => {
                    let node = self.resolve(value, alternatives, processors)?;
                    match node.scalar_string() {
                        Some(s) => out.push_str(&s),
                        None => {
                            return Err(TranspilerError::InvalidVariable {
                                expr: value.to_string(),
                                reason: format!(
                                    "cannot embed a {} inside a string",
                                    node.kind()
                                ),
                            })
                        }
                    }
                }
            }
        }
        Ok(Node::Str(out))
    }

    fn resolve(
        &self,
        expr: &str,
        alternatives: &[Alternative],
        processors: &mut Option<Processors>,
    ) -> TranspilerResult<Node> {
        for alternative in alternatives {
            match alternative {
                Alternative::Constant(c) => return Ok(Node::Str(c.clone())),
                Alternative::Variable(name) => {
                    if let Some(node) = self.lookup(name) {
                        if processors.is_none() {
                            *processors = self.processors_for(name).cloned();
                        }
                        return Ok(node.clone());
                    }
                }
            }
        }
        Err(TranspilerError::Unresolved(expr.to_string()))
    }
}

impl Node {
    /// Substitute variables throughout this node, returning a new node.
    pub fn apply(
        &self,
        vars: &Vars,
        processors: &mut Option<Processors>,
    ) -> TranspilerResult<Node> {
        match self {
            Node::Dict(dict) => {
                let mut out = Dict::new();
                for (key, value) in dict.iter() {
                    out.insert(key, value.apply(vars, processors)?);
                }
                Ok(Node::Dict(out))
            }
            Node::List(items) => {
                let rendered = items
                    .iter()
                    .map(|item| item.apply(vars, processors))
                    .collect::<TranspilerResult<Vec<_>>>()?;
                Ok(Node::List(rendered))
            }
            Node::Str(s) => vars.replace(s, processors),
            scalar => Ok(scalar.clone()),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Text(String),
    Reference(Vec<Alternative>),
}

#[derive(Debug, PartialEq)]
enum Alternative {
    Variable(String),
    Constant(String),
}

fn tokenize(value: &str) -> TranspilerResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = value;

    while let Some(start) = rest.find('$') {
        let (before, after) = rest.split_at(start);
        text.push_str(before);
        if let Some(escaped) = after.strip_prefix("$${") {
            text.push_str("${");
            rest = escaped;
        } else if let Some(body) = after.strip_prefix("${") {
            let end = find_closing(body).ok_or_else(|| TranspilerError::InvalidVariable {
                expr: value.to_string(),
                reason: "missing closing '}'".to_string(),
            })?;
            if !text.is_empty() {
                tokens.push(Token::Text(std::mem::take(&mut text)));
            }
            tokens.push(Token::Reference(parse_alternatives(value, &body[..end])?));
            rest = &body[end + 1..];
        } else {
            text.push('$');
            rest = &after[1..];
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(tokens)
}

/// Position of the `}` closing a reference, skipping quoted constants.
fn find_closing(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '}') => return Some(idx),
            (None, _) => {}
        }
    }
    None
}

fn parse_alternatives(expr: &str, body: &str) -> TranspilerResult<Vec<Alternative>> {
    let invalid = |reason: &str| TranspilerError::InvalidVariable {
        expr: expr.to_string(),
        reason: reason.to_string(),
    };

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in body.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '|') => pieces.push(std::mem::take(&mut current)),
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(invalid("missing ending quote"));
    }
    pieces.push(current);

    pieces
        .iter()
        .map(|piece| {
            let piece = piece.trim();
            if piece.is_empty() {
                return Err(invalid("empty alternative"));
            }
            for q in ['\'', '"'] {
                if let Some(quoted) = piece.strip_prefix(q) {
                    return match quoted.strip_suffix(q) {
                        Some(inner) if !inner.contains(q) => {
                            Ok(Alternative::Constant(inner.to_string()))
                        }
                        _ => Err(invalid("malformed constant")),
                    };
                }
            }
            if piece.contains(['\'', '"']) {
                return Err(invalid("unexpected quote inside variable name"));
            }
            Ok(Alternative::Variable(validate_name(expr, piece)?))
        })
        .collect()
}

fn validate_name(expr: &str, name: &str) -> TranspilerResult<String> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    if !valid || name.starts_with('.') || name.ends_with('.') {
        return Err(TranspilerError::InvalidVariable {
            expr: expr.to_string(),
            reason: format!("invalid variable name '{}'", name),
        });
    }
    Ok(name.to_string())
}
