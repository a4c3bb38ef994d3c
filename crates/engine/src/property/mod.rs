//! Property evaluation: decode → transform → validate → state update, and
//! the inverse write path.
pub mod decode;
pub mod encode;
pub mod expr;
pub mod state;
pub mod transform;

use crate::freeze::SnapshotScope;
use crate::mapping::LoadedMapping;
use crate::property::decode::{DecodeCtx, DecodeError};
use crate::property::expr::{Bind, Scope};
use crate::property::state::StateMap;
use crate::store::MemoryStore;
use shared::Value;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    #[error("property not found: \"{0}\"")]
    NotFound(String),

    #[error("property \"{0}\" is read-only")]
    ReadOnly(String),

    #[error("property \"{0}\" is computed and cannot be written")]
    Computed(String),

    #[error("property \"{0}\" is frozen; unfreeze it or re-freeze with the new value")]
    Frozen(String),

    #[error("no write encoding for \"{name}\": {reason}")]
    UnsupportedWrite { name: String, reason: String },

    #[error("validation failed for \"{name}\": {message}")]
    ValidationFailed { name: String, message: String },

    #[error("decode failed for \"{name}\": {reason}")]
    DecodeFailed { name: String, reason: String },
}

/// One validation-rule failure observed during evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationEvent {
    pub rule: String,
    pub message: String,
    pub value: Value,
}

/// Everything a property evaluation needs, bundled once per call site.
pub struct PropertyContext<'a> {
    pub store: &'a MemoryStore,
    pub states: &'a StateMap,
    pub loaded: &'a LoadedMapping,
    pub snapshot: &'a SnapshotScope,
}

/// Result of one evaluation pass over a property or computed node.
pub struct EvalOutcome {
    pub value: Value,
    /// Whether the stored state value changed with this evaluation.
    pub changed: bool,
    pub events: Vec<ValidationEvent>,
}

/// Snapshot values first, mapping constants second.
struct AmbientScope<'a> {
    snapshot: &'a SnapshotScope,
    constants: &'a HashMap<String, Value>,
}

impl Scope for AmbientScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.snapshot.read().unwrap().get(name) {
            return Some(value.clone());
        }
        self.constants.get(name).cloned()
    }
}

/// Evaluates a property or computed node by name, updating its state.
pub fn evaluate(ctx: &PropertyContext<'_>, name: &str) -> Result<EvalOutcome, PropertyError> {
    if let Some(prop) = ctx.loaded.mapping.properties.get(name) {
        return evaluate_property(ctx, name, prop);
    }
    if ctx.loaded.mapping.computed.contains_key(name) {
        return evaluate_computed_recursive(ctx, name);
    }
    Err(PropertyError::NotFound(name.to_string()))
}

fn evaluate_property(
    ctx: &PropertyContext<'_>,
    name: &str,
    prop: &crate::mapping::Property,
) -> Result<EvalOutcome, PropertyError> {
    let mapping = &ctx.loaded.mapping;
    let endian = mapping.endianness_of(prop);
    let scope = AmbientScope {
        snapshot: ctx.snapshot,
        constants: &mapping.constants,
    };
    let mut events = Vec::new();
    let dctx = DecodeCtx {
        store: ctx.store,
        mapping,
    };

    let raw = match decode::decode(
        &dctx,
        prop.address,
        prop.width,
        &prop.kind,
        endian,
        &scope,
        &mut events,
    ) {
        Ok(value) => value,
        // The emulator may not have populated the region yet; degrade to a
        // typed zero without touching state or emitting anything.
        Err(DecodeError::Store(_)) => {
            return Ok(EvalOutcome {
                value: decode::zero_value(&prop.kind),
                changed: false,
                events: Vec::new(),
            });
        }
        Err(DecodeError::Invalid(reason)) => {
            return Err(PropertyError::DecodeFailed {
                name: name.to_string(),
                reason,
            });
        }
    };

    let bytes = ctx
        .store
        .read_bytes(prop.address, prop.width)
        .unwrap_or_default();
    let value = transform::apply_chain(raw, ctx.loaded.transforms_of(name), &scope, &mut events);

    if mapping.validation.enabled {
        validate_soft(ctx, name, &value, &scope, &mut events);
    }

    let changed = ctx.states.observe_read(name, &value, &bytes);
    ctx.states.record_events(name, &events);
    Ok(EvalOutcome {
        value,
        changed,
        events,
    })
}

/// Evaluates a computed node against a caller-built scope that already
/// holds every dependency (the monitor path).
pub fn evaluate_computed_with(
    ctx: &PropertyContext<'_>,
    name: &str,
    scope: &dyn Scope,
) -> Result<EvalOutcome, PropertyError> {
    let node = ctx
        .loaded
        .mapping
        .computed
        .get(name)
        .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;
    let compiled = ctx
        .loaded
        .computed_expr(name)
        .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;

    let dep_values: Vec<Value> = node
        .dependencies
        .iter()
        .map(|dep| scope.lookup(dep).unwrap_or(Value::Int(0)))
        .collect();

    let value = if node.cached
        && let Some(cached) = ctx.loaded.cache_lookup(name, &dep_values)
    {
        cached
    } else {
        let value = compiled
            .eval(scope)
            .map_err(|err| PropertyError::DecodeFailed {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        if node.cached {
            ctx.loaded.cache_store(name, dep_values, value.clone());
        }
        value
    };

    let changed = ctx.states.observe_read(name, &value, &[]);
    Ok(EvalOutcome {
        value,
        changed,
        events: Vec::new(),
    })
}

/// API path: resolves dependencies by evaluating them fresh. Terminates
/// because dependency cycles are rejected at load.
fn evaluate_computed_recursive(
    ctx: &PropertyContext<'_>,
    name: &str,
) -> Result<EvalOutcome, PropertyError> {
    let node = ctx
        .loaded
        .mapping
        .computed
        .get(name)
        .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;

    let mut dep_scope: HashMap<String, Value> = HashMap::new();
    for dep in &node.dependencies {
        let outcome = evaluate(ctx, dep)?;
        dep_scope.insert(dep.clone(), outcome.value);
    }

    let ambient = AmbientScope {
        snapshot: ctx.snapshot,
        constants: &ctx.loaded.mapping.constants,
    };
    let layered = LayeredScope {
        first: &dep_scope,
        second: &ambient,
    };
    evaluate_computed_with(ctx, name, &layered)
}

struct LayeredScope<'a> {
    first: &'a HashMap<String, Value>,
    second: &'a dyn Scope,
}

impl Scope for LayeredScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.first
            .get(name)
            .cloned()
            .or_else(|| self.second.lookup(name))
    }
}

/// Runs declared validation rules, pushing an event per failed rule. The
/// value is returned to the caller regardless.
fn validate_soft(
    ctx: &PropertyContext<'_>,
    name: &str,
    value: &Value,
    scope: &dyn Scope,
    events: &mut Vec<ValidationEvent>,
) {
    let Some(validation) = ctx.loaded.validation_of(name) else {
        return;
    };
    let rules = &validation.rules;

    if let (Some(min), Some(x)) = (rules.min, value.as_f64())
        && x < min
    {
        events.push(ValidationEvent {
            rule: "min".into(),
            message: format!("value {x} below minimum {min}"),
            value: value.clone(),
        });
    }
    if let (Some(max), Some(x)) = (rules.max, value.as_f64())
        && x > max
    {
        events.push(ValidationEvent {
            rule: "max".into(),
            message: format!("value {x} above maximum {max}"),
            value: value.clone(),
        });
    }
    if let Some(allowed) = &rules.allowed_values
        && !allowed.contains(value)
    {
        events.push(ValidationEvent {
            rule: "allowed-values".into(),
            message: "value not in allowed set".into(),
            value: value.clone(),
        });
    }
    if let (Some(regex), Value::Str(s)) = (&validation.regex, value)
        && !regex.is_match(s)
    {
        events.push(ValidationEvent {
            rule: "regex".into(),
            message: format!("\"{s}\" does not match /{}/", regex.as_str()),
            value: value.clone(),
        });
    }
    if rules.required
        && let Value::Str(s) = value
        && s.is_empty()
    {
        events.push(ValidationEvent {
            rule: "required".into(),
            message: "required string is empty".into(),
            value: value.clone(),
        });
    }
    if let Some(cross) = &validation.cross {
        let bound = Bind {
            name: "value",
            value,
            parent: scope,
        };
        match cross.eval_bool(&bound) {
            Ok(true) => {}
            Ok(false) => events.push(ValidationEvent {
                rule: "cross-property".into(),
                message: format!("predicate {} failed", cross.source()),
                value: value.clone(),
            }),
            Err(err) => events.push(ValidationEvent {
                rule: "cross-property".into(),
                message: err.to_string(),
                value: value.clone(),
            }),
        }
    }
}

/// Write-path validation: any failed rule rejects the write.
pub fn validate_strict(
    ctx: &PropertyContext<'_>,
    name: &str,
    value: &Value,
) -> Result<(), PropertyError> {
    if !ctx.loaded.mapping.validation.enabled {
        return Ok(());
    }
    let scope = AmbientScope {
        snapshot: ctx.snapshot,
        constants: &ctx.loaded.mapping.constants,
    };
    let mut events = Vec::new();
    validate_soft(ctx, name, value, &scope, &mut events);
    match events.into_iter().next() {
        None => Ok(()),
        Some(event) => Err(PropertyError::ValidationFailed {
            name: name.to_string(),
            message: format!("{}: {}", event.rule, event.message),
        }),
    }
}
