//! Built-in handlers.
//!
//! They are public so custom registries can reuse them when overriding only
//! a few pairs.

use indexmap::IndexMap;

use super::{Interrupt, Outcome, Registry, ResolveCx, Settled};
use crate::error::{ErrorCode, ErrorInfo};
use crate::model::{
    Definition, DefinitionKind, Json, Key, Node, NodeKind, Operation, OperationKind, OperationSpec,
    Transform,
};

pub(crate) fn install(registry: &mut Registry) {
    use NodeKind as N;
    use OperationKind as O;

    for kind in [
        N::Value,
        N::Nil,
        N::Error,
        N::Pending,
        N::Tree,
        N::Action,
        N::QuerySetResult,
    ] {
        registry.register(kind, O::Resolve, resolve_static);
    }
    registry.register(N::Array, O::Resolve, resolve_array);

    registry.register(N::Tree, O::GetChild, tree_child);
    registry.register(N::Value, O::GetChild, value_child);
    registry.register(N::Array, O::GetChild, array_child);
    registry.register(N::QuerySetResult, O::GetChild, query_result_child);

    registry.register(N::Array, O::GetItems, array_items);
    registry.register(N::Value, O::GetItems, value_items);
    registry.register(N::Nil, O::GetItems, nil_items);

    registry.register(N::Computed, O::Evaluate, evaluate_computed);
    registry.register(N::Variable, O::Evaluate, evaluate_variable);
    registry.register(N::Variable, O::Set, set_variable);
    registry.register(N::Variable, O::Reset, reset_variable);
    registry.register(N::Reference, O::Evaluate, evaluate_reference);
    registry.register(N::Root, O::Evaluate, evaluate_root);
    registry.register(N::Get, O::Evaluate, evaluate_get);
    registry.register(N::Items, O::Evaluate, evaluate_items);
    registry.register(N::IfPending, O::Evaluate, evaluate_if_pending);
    registry.register(N::CatchError, O::Evaluate, evaluate_catch_error);
    registry.register(N::Action, O::Call, call_action);
    registry.register(N::Source, O::Evaluate, evaluate_source);
    registry.register(N::QuerySet, O::Evaluate, evaluate_query_set);
}

fn malformed(node: &Node, operation: &Operation) -> Interrupt {
    Interrupt::Error(ErrorInfo::new(
        ErrorCode::TypeMismatch,
        format!("{} handler cannot apply {}", node.kind(), operation),
    ))
}

fn invalid_key(key: &Key) -> Interrupt {
    Interrupt::Error(ErrorInfo::new(
        ErrorCode::InvalidKey,
        format!("Invalid child key: {}", key.describe()),
    ))
}

fn child_key<'o>(node: &Node, operation: &'o Operation) -> Result<&'o Key, Interrupt> {
    match operation.spec() {
        OperationSpec::GetChild(key) => Ok(key),
        _ => Err(malformed(node, operation)),
    }
}

fn item_transforms<'o>(node: &Node, operation: &'o Operation) -> Result<&'o [Transform], Interrupt> {
    match operation.spec() {
        OperationSpec::GetItems(transforms) => Ok(transforms),
        _ => Err(malformed(node, operation)),
    }
}

fn annotate(interrupt: Interrupt, node: &Node) -> Interrupt {
    match interrupt {
        Interrupt::Error(info) => Interrupt::Error(info.at_path(node.definition().path_hint())),
        other => other,
    }
}

/// Evaluate `node`, then apply `operation` to the result.
pub fn pass_through(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let evaluated = cx.resolve_node(node, &Operation::evaluate())?;
    if operation.is_cacheable() {
        Ok(cx.resolve_node(&evaluated, operation)?.definition().clone())
    } else {
        cx.execute(&evaluated, operation)
    }
}

// ----------------------------------------------------------------------------
// Static nodes
// ----------------------------------------------------------------------------

/// Static nodes resolve to themselves.
pub fn resolve_static(_cx: &mut ResolveCx<'_>, node: &Node, _operation: &Operation) -> Outcome {
    Ok(node.definition().clone())
}

/// Arrays resolve to the JSON array of their resolved items.
pub fn resolve_array(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::Array(items) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    Ok(Definition::value(Json::Array(cx.resolve_all(items)?)))
}

pub fn tree_child(_cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let key = child_key(node, operation)?;
    let DefinitionKind::Tree(branches) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    match key {
        Key::Name(name) => branches.get(name).cloned().ok_or_else(|| invalid_key(key)),
        Key::Index(_) => Err(invalid_key(key)),
    }
}

pub fn value_child(_cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let key = child_key(node, operation)?;
    let DefinitionKind::Value(value) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    let child = match (value, key) {
        (Json::Object(fields), Key::Name(name)) => fields.get(name),
        (Json::Array(items), Key::Index(index)) => items.get(*index),
        _ => None,
    };
    child
        .map(|value| Definition::value(value.clone()))
        .ok_or_else(|| invalid_key(key))
}

pub fn array_child(_cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let key = child_key(node, operation)?;
    let DefinitionKind::Array(items) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    match key {
        Key::Index(index) => items.get(*index).cloned().ok_or_else(|| invalid_key(key)),
        Key::Name(_) => Err(invalid_key(key)),
    }
}

pub fn query_result_child(_cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let key = child_key(node, operation)?;
    let DefinitionKind::QuerySetResult(fields) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    match key {
        Key::Name(name) => fields
            .get(name)
            .map(|value| Definition::value(value.clone()))
            .ok_or_else(|| invalid_key(key)),
        Key::Index(_) => Err(invalid_key(key)),
    }
}

// ----------------------------------------------------------------------------
// Collections
// ----------------------------------------------------------------------------

fn apply_transforms(
    cx: &mut ResolveCx<'_>,
    mut items: Vec<Definition>,
    transforms: &[Transform],
) -> Result<Vec<Definition>, Interrupt> {
    for transform in transforms {
        items = match transform {
            Transform::Filter(predicate) => {
                let mut kept = Vec::with_capacity(items.len());
                for item in items {
                    let value = cx.resolve_value(&item)?;
                    if (predicate.get())(&value) {
                        kept.push(item);
                    }
                }
                kept
            }
            Transform::Where { field, equals } => {
                let mut kept = Vec::with_capacity(items.len());
                for item in items {
                    let value = cx.resolve_value(&item)?;
                    if value.get(field) == Some(equals) {
                        kept.push(item);
                    }
                }
                kept
            }
            Transform::Map(mapping) => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in &items {
                    let value = cx.resolve_value(item)?;
                    mapped.push(Definition::value((mapping.get())(&value)));
                }
                mapped
            }
            Transform::Take(count) => items.into_iter().take(*count).collect(),
            Transform::Skip(count) => items.into_iter().skip(*count).collect(),
        };
    }
    Ok(items)
}

pub fn array_items(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let transforms = item_transforms(node, operation)?;
    let DefinitionKind::Array(items) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    Ok(Definition::array(apply_transforms(cx, items.clone(), transforms)?))
}

pub fn value_items(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let transforms = item_transforms(node, operation)?;
    let Some(Json::Array(values)) = node.definition().as_value() else {
        return Err(Interrupt::Error(ErrorInfo::new(
            ErrorCode::TypeMismatch,
            "getItems requires an array value",
        )));
    };
    let items = values.into_iter().map(Definition::value).collect();
    Ok(Definition::array(apply_transforms(cx, items, transforms)?))
}

/// `nil` lists as an empty collection.
pub fn nil_items(_cx: &mut ResolveCx<'_>, _node: &Node, _operation: &Operation) -> Outcome {
    Ok(Definition::array(Vec::new()))
}

// ----------------------------------------------------------------------------
// Dynamic nodes
// ----------------------------------------------------------------------------

pub fn evaluate_computed(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::Computed {
        dependencies,
        combine,
    } = node.definition().kind()
    else {
        return Err(malformed(node, operation));
    };
    let values = cx.resolve_all(dependencies)?;
    (combine.get())(&values).map_err(Interrupt::Error)
}

pub fn evaluate_variable(cx: &mut ResolveCx<'_>, node: &Node, _operation: &Operation) -> Outcome {
    Ok(Definition::value(cx.variable(node)))
}

pub fn set_variable(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let OperationSpec::Set(value) = operation.spec() else {
        return Err(malformed(node, operation));
    };
    cx.write_variable(node, Some(value.clone()));
    Ok(Definition::nil())
}

pub fn reset_variable(cx: &mut ResolveCx<'_>, node: &Node, _operation: &Operation) -> Outcome {
    cx.write_variable(node, None);
    Ok(Definition::nil())
}

/// Walk the reference's keys from the scope root. The final child is
/// returned unresolved, so operations like `set` reach the node itself.
pub fn evaluate_reference(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::Reference(keys) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    let mut current = cx.scope_root()?;
    for key in keys {
        let target = cx
            .resolve_static(&current)
            .map_err(|interrupt| annotate(interrupt, node))?;
        current = cx
            .resolve_node(&target, &Operation::get_child(key.clone()))
            .map_err(|interrupt| annotate(interrupt, node))?
            .definition()
            .clone();
    }
    Ok(current)
}

pub fn evaluate_root(cx: &mut ResolveCx<'_>, _node: &Node, _operation: &Operation) -> Outcome {
    cx.scope_root()
}

pub fn evaluate_get(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::Get { target, key } = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    let target = cx
        .resolve_static(target)
        .map_err(|interrupt| annotate(interrupt, node))?;
    let child = cx
        .resolve_node(&target, &Operation::get_child(key.clone()))
        .map_err(|interrupt| annotate(interrupt, node))?;
    Ok(child.definition().clone())
}

pub fn evaluate_items(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::Items { target, transforms } = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    let target = cx.resolve_static(target)?;
    let items = cx.resolve_node(&target, &Operation::get_items(transforms.clone()))?;
    Ok(items.definition().clone())
}

pub fn evaluate_if_pending(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::IfPending { target, fallback } = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    match cx.settle(target, &Operation::resolve())? {
        Settled::Ready(result) => Ok(result.definition().clone()),
        Settled::Pending => Ok(fallback.clone()),
        Settled::Failed(info) => Err(Interrupt::Error(info)),
    }
}

pub fn evaluate_catch_error(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::CatchError { target, recover } = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    match cx.settle(target, &Operation::resolve())? {
        Settled::Ready(result) => Ok(result.definition().clone()),
        Settled::Pending => Err(Interrupt::Pending),
        Settled::Failed(info) => Ok((recover.get())(&info)),
    }
}

/// Invoke the action body and resolve what it returns.
pub fn call_action(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let (DefinitionKind::Action(body), OperationSpec::Call(args)) =
        (node.definition().kind(), operation.spec())
    else {
        return Err(malformed(node, operation));
    };
    let returned = (body.get())(args.as_slice()).map_err(Interrupt::Error)?;
    Ok(cx.resolve(&returned, &Operation::resolve())?.definition().clone())
}

pub fn evaluate_source(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::Source { source, .. } = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    cx.connect_source(source)?.ok_or(Interrupt::Pending)
}

pub fn evaluate_query_set(cx: &mut ResolveCx<'_>, node: &Node, operation: &Operation) -> Outcome {
    let DefinitionKind::QuerySet(fields) = node.definition().kind() else {
        return Err(malformed(node, operation));
    };
    let definitions: Vec<Definition> = fields.values().cloned().collect();
    let values = cx.resolve_all(&definitions)?;
    let result: IndexMap<String, Json> = fields.keys().cloned().zip(values).collect();
    Ok(Definition::query_set_result(result))
}
