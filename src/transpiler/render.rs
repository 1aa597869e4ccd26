//! Input fan-out over variable contexts.

use super::ast::{Node, Processors};
use super::vars::Vars;
use super::{TranspilerError, TranspilerResult};
use std::collections::HashSet;
use tracing::debug;

const CONDITION_KEY: &str = "condition";
const PROCESSORS_KEY: &str = "processors";

/// Render every input template once per Vars context.
///
/// A template that references a variable missing from a context is dropped
/// for that context only. Inputs whose `condition` evaluates to false are
/// dropped as well. Rendered inputs that are identical to one produced
/// earlier are removed, keeping first-seen order. Processors carried by the
/// context are prepended to the input's `processors` list after the
/// duplicate check.
pub fn render_inputs(inputs: &Node, vars_list: &[Vars]) -> TranspilerResult<Vec<Node>> {
    let templates = inputs
        .as_list()
        .ok_or_else(|| TranspilerError::InvalidType {
            path: "inputs".to_string(),
            expected: "list",
            found: inputs.kind(),
        })?;

    let mut seen = HashSet::new();
    let mut rendered = Vec::new();
    let templates: Vec<(Node, Option<Node>)> = templates.iter().map(split_condition).collect();
    for vars in vars_list {
        for (template, condition) in &templates {
            match condition_holds(condition.as_ref(), vars) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Dropping input, condition evaluated to false");
                    continue;
                }
                Err(TranspilerError::Unresolved(expr)) => {
                    debug!("Dropping input, unresolved variable in condition '{}'", expr);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut processors = None;
            let mut input = match template.apply(vars, &mut processors) {
                Ok(input) => input,
                Err(TranspilerError::Unresolved(expr)) => {
                    debug!("Dropping input, unresolved variable in '{}'", expr);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !seen.insert(input.hash()) {
                continue;
            }
            if let Some(processors) = processors {
                attach_processors(&mut input, processors);
            }
            rendered.push(input);
        }
    }
    Ok(rendered)
}

fn attach_processors(input: &mut Node, processors: Processors) {
    let Some(dict) = input.as_dict_mut() else {
        return;
    };
    match dict.get_mut(PROCESSORS_KEY) {
        None => {
            dict.insert(PROCESSORS_KEY, Node::List(processors));
        }
        Some(Node::List(existing)) => {
            let mut merged = processors;
            merged.append(existing);
            *existing = merged;
        }
        // Not a list, leave the user's value untouched.
        Some(_) => {}
    }
}

/// Template without its `condition`, and the condition.
fn split_condition(template: &Node) -> (Node, Option<Node>) {
    let mut template = template.clone();
    let condition = template.as_dict_mut().and_then(|d| d.remove(CONDITION_KEY));
    (template, condition)
}

fn condition_holds(condition: Option<&Node>, vars: &Vars) -> TranspilerResult<bool> {
    match condition {
        None => Ok(true),
        Some(Node::Bool(b)) => Ok(*b),
        Some(Node::Str(expr)) => evaluate_condition(expr, vars),
        Some(other) => Err(TranspilerError::InvalidCondition(format!(
            "expected a string or bool, found {}",
            other.kind()
        ))),
    }
}

/// Evaluate an input condition against `vars`.
///
/// Supports `a == b`, `a != b`, `true`, `false`, combined with `and`/`or`
/// (`and` binds tighter). Operands may be quoted. The expression is split
/// into terms before variables are substituted, so substituted values are
/// only ever compared, never parsed.
pub fn evaluate_condition(expr: &str, vars: &Vars) -> TranspilerResult<bool> {
    let mut any = false;
    for clause in split_unquoted(expr, " or ") {
        let mut all = true;
        for term in split_unquoted(clause, " and ") {
            all &= evaluate_term(expr, term.trim(), vars)?;
        }
        any |= all;
    }
    Ok(any)
}

fn evaluate_term(expr: &str, term: &str, vars: &Vars) -> TranspilerResult<bool> {
    for (op, equal) in [("!=", false), ("==", true)] {
        if let [lhs, rhs] = split_unquoted(term, op)[..] {
            let same = operand(lhs, vars)? == operand(rhs, vars)?;
            return Ok(same == equal);
        }
    }
    match operand(term, vars)?.as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(TranspilerError::InvalidCondition(expr.to_string())),
    }
}

/// Unquote `raw` and substitute its variables.
fn operand(raw: &str, vars: &Vars) -> TranspilerResult<String> {
    let raw = unquote(raw);
    let node = vars.replace(raw, &mut None)?;
    node.scalar_string().ok_or_else(|| {
        TranspilerError::InvalidCondition(format!(
            "'{}' resolves to a {}, expected a scalar",
            raw,
            node.kind()
        ))
    })
}

/// Split on `sep` outside quotes and `${...}` references.
fn split_unquoted<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '$') if matches!(chars.peek(), Some((_, '{'))) => {
                depth += 1;
                chars.next();
            }
            (None, '}') if depth > 0 => depth -= 1,
            (None, _) if depth == 0 && i >= start && s[i..].starts_with(sep) => {
                parts.push(&s[start..i]);
                start = i + sep.len();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for q in ['\'', '"'] {
        if let Some(inner) = s.strip_prefix(q).and_then(|s| s.strip_suffix(q)) {
            return inner;
        }
    }
    s
}
