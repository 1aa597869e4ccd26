//! Variable context providers
//!
//! Builds the [`Vars`] contexts used to render templated inputs. Every
//! context carries the fixed `path`, `host` and `agent` keys; the policy can
//! add static values through `providers.local.vars` and one context per
//! dynamic item through `providers.local_dynamic.items`.

use crate::config::Environment;
use crate::info::AgentInfo;
use crate::transpiler::{Ast, Dict, Node, TranspilerError, TranspilerResult, Vars};
use tracing::debug;

const PROVIDERS_KEY: &str = "providers";
const LOCAL: &str = "local";
const LOCAL_DYNAMIC: &str = "local_dynamic";

/// Remove the `providers` section from `ast` and build the Vars contexts.
///
/// With no dynamic items exactly one context is returned.
pub fn build_vars(ast: &mut Ast, env: &Environment, info: &AgentInfo) -> TranspilerResult<Vec<Vars>> {
    let providers = ast.remove(PROVIDERS_KEY);
    let mut base = fixed_context(env, info);

    let Some(providers) = providers else {
        return Ok(vec![Vars::new(Ast::from_dict(base))]);
    };
    let providers = providers.as_dict().ok_or_else(|| TranspilerError::InvalidType {
        path: PROVIDERS_KEY.to_string(),
        expected: "dict",
        found: providers.kind(),
    })?;

    if let Some(local) = providers.lookup("local.vars") {
        let vars = local.as_dict().ok_or_else(|| TranspilerError::InvalidType {
            path: "providers.local.vars".to_string(),
            expected: "dict",
            found: local.kind(),
        })?;
        base.insert(LOCAL, Node::Dict(vars.clone()));
    }

    let Some(items) = providers.lookup("local_dynamic.items") else {
        return Ok(vec![Vars::new(Ast::from_dict(base))]);
    };
    let items = items.as_list().ok_or_else(|| TranspilerError::InvalidType {
        path: "providers.local_dynamic.items".to_string(),
        expected: "list",
        found: items.kind(),
    })?;
    if items.is_empty() {
        return Ok(vec![Vars::new(Ast::from_dict(base))]);
    }

    let mut contexts = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let path = format!("providers.local_dynamic.items.{}", idx);
        let vars = match item.lookup("vars") {
            Some(Node::Dict(vars)) => vars.clone(),
            Some(other) => {
                return Err(TranspilerError::InvalidType {
                    path: format!("{}.vars", path),
                    expected: "dict",
                    found: other.kind(),
                })
            }
            None => Dict::new(),
        };

        let mut tree = base.clone();
        tree.insert(LOCAL_DYNAMIC, Node::Dict(vars));
        let context = match item.lookup("processors") {
            Some(Node::List(processors)) => {
                Vars::with_processors(Ast::from_dict(tree), LOCAL_DYNAMIC, processors.clone())
            }
            Some(other) => {
                return Err(TranspilerError::InvalidType {
                    path: format!("{}.processors", path),
                    expected: "list",
                    found: other.kind(),
                })
            }
            None => Vars::new(Ast::from_dict(tree)),
        };
        contexts.push(context);
    }
    debug!("Built {} dynamic variable contexts", contexts.len());
    Ok(contexts)
}

fn fixed_context(env: &Environment, info: &AgentInfo) -> Dict {
    let mut path = Dict::new();
    for (key, value) in [
        ("home", env.home()),
        ("data", env.data()),
        ("config", env.config()),
        ("logs", env.logs()),
    ] {
        path.insert(key, Node::from(value.to_string_lossy().into_owned()));
    }

    let mut host = Dict::new();
    host.insert("name", Node::from(info.hostname.as_str()));

    let mut agent = Dict::new();
    agent.insert("id", Node::from(info.agent_id.as_str()));
    agent.insert("version", Node::from(info.version.as_str()));

    let mut root = Dict::new();
    root.insert("path", Node::Dict(path));
    root.insert("host", Node::Dict(host));
    root.insert("agent", Node::Dict(agent));
    root
}
