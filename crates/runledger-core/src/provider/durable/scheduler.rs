// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step layering and the continue-as-new policy.
//!
//! Steps are grouped into layers so that every dependency of a step lives in a
//! strictly earlier layer. Within a layer, steps keep declaration order.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::plan::PlanStep;

fn invalid(message: String) -> CoreError {
    CoreError::InvalidPlanSchema { message }
}

/// Group step ids into execution layers.
///
/// Without any `dependsOn` in the plan every step gets its own layer. Each of
/// the following fails with its own `INVALID_PLAN_SCHEMA` message: duplicate
/// step id, non-string dependency value, self-dependency, unknown dependency,
/// dependency cycle.
pub fn plan_execution_layers(steps: &[PlanStep]) -> Result<Vec<Vec<String>>> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.step_id.as_str()) {
            return Err(invalid(format!("duplicate step id '{}'", step.step_id)));
        }
    }

    if steps.iter().all(|s| s.depends_on.is_none()) {
        return Ok(steps.iter().map(|s| vec![s.step_id.clone()]).collect());
    }

    let mut deps: HashMap<&str, Vec<&str>> = HashMap::with_capacity(steps.len());
    for step in steps {
        let id = step.step_id.as_str();
        let step_deps = dependencies(step)?;
        for dep in &step_deps {
            if *dep == id {
                return Err(invalid(format!("step '{}' depends on itself", id)));
            }
            if !seen.contains(dep) {
                return Err(invalid(format!(
                    "step '{}' depends on unknown step '{}'",
                    id, dep
                )));
            }
        }
        deps.insert(id, step_deps);
    }

    let mut done = HashSet::new();
    for step in steps {
        let mut path = Vec::new();
        if let Err(cycle) = find_cycle(&step.step_id, &deps, &mut done, &mut path) {
            return Err(invalid(format!(
                "dependency cycle detected: {}",
                cycle.join(" -> ")
            )));
        }
    }

    let mut placed: HashSet<&str> = HashSet::with_capacity(steps.len());
    let mut layers = Vec::new();
    while placed.len() < steps.len() {
        let layer: Vec<&str> = steps
            .iter()
            .map(|s| s.step_id.as_str())
            .filter(|id| !placed.contains(id))
            .filter(|id| deps[id].iter().all(|dep| placed.contains(dep)))
            .collect();
        if layer.is_empty() {
            // Unreachable after the cycle check.
            return Err(invalid("steps could not be layered".to_string()));
        }
        placed.extend(layer.iter().copied());
        layers.push(layer.into_iter().map(str::to_string).collect());
    }
    Ok(layers)
}

fn dependencies(step: &PlanStep) -> Result<Vec<&str>> {
    let non_string = |value: &Value| {
        invalid(format!(
            "step '{}' has a non-string dependency value: {}",
            step.step_id, value
        ))
    };
    match &step.depends_on {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(dep)) => Ok(vec![dep.as_str()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().ok_or_else(|| non_string(item)))
            .collect(),
        Some(other) => Err(non_string(other)),
    }
}

/// Depth-first search; `Err` carries the cycle path with its start repeated.
fn find_cycle<'a>(
    node: &'a str,
    deps: &HashMap<&'a str, Vec<&'a str>>,
    done: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> std::result::Result<(), Vec<&'a str>> {
    if let Some(start) = path.iter().position(|n| *n == node) {
        let mut cycle = path[start..].to_vec();
        cycle.push(node);
        return Err(cycle);
    }
    if done.contains(node) {
        return Ok(());
    }

    path.push(node);
    for dep in deps.get(node).into_iter().flatten() {
        find_cycle(*dep, deps, done, path)?;
    }
    path.pop();
    done.insert(node);
    Ok(())
}

/// Whether to checkpoint with continue-as-new before the next layer.
///
/// A threshold of 0 disables continuation. Otherwise continue once
/// `processed_in_execution` reaches the threshold and a layer is still pending.
pub fn should_trigger_continue_as_new(
    continue_as_new_after_layers: u32,
    processed_in_execution: u32,
    next_layer_index: usize,
    total_layers: usize,
) -> bool {
    continue_as_new_after_layers != 0
        && processed_in_execution >= continue_as_new_after_layers
        && next_layer_index < total_layers
}
