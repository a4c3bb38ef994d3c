//! Load-time compiled form of a mapping: validated model plus parsed
//! transform chains, validation rules, and computed-node expressions.
use crate::mapping::{Mapping, MappingError, ValidationRules};
use crate::property::expr::{self, CompiledExpr};
use crate::property::transform::{self, CompiledTransform};
use regex::Regex;
use shared::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Validation rules with their regex and cross-property predicate parsed.
#[derive(Debug)]
pub struct CompiledValidation {
    pub rules: ValidationRules,
    pub regex: Option<Regex>,
    pub cross: Option<CompiledExpr>,
}

#[derive(Debug)]
pub struct LoadedMapping {
    pub mapping: Arc<Mapping>,
    /// Computed nodes in dependency order, fixed at load.
    pub computed_order: Vec<String>,
    transforms: HashMap<String, Vec<CompiledTransform>>,
    validations: HashMap<String, CompiledValidation>,
    computed_exprs: HashMap<String, CompiledExpr>,
    /// Dependency-value tuple → result, for nodes that opt into caching.
    computed_cache: Mutex<HashMap<String, (Vec<Value>, Value)>>,
}

impl LoadedMapping {
    /// Validates the mapping and compiles everything expression-shaped.
    pub fn compile(mapping: Arc<Mapping>) -> Result<Self, MappingError> {
        mapping.validate()?;
        let computed_order = mapping
            .computed_order()
            .expect("cycles are caught by validate");

        let mut causes = Vec::new();
        let mut transforms = HashMap::new();
        let mut validations = HashMap::new();
        let mut computed_exprs = HashMap::new();

        for (name, prop) in &mapping.properties {
            if !prop.transforms.is_empty() {
                match transform::compile_chain(&prop.transforms) {
                    Ok(chain) => {
                        transforms.insert(name.clone(), chain);
                    }
                    Err(err) => causes.push(format!("property \"{name}\" transform: {err}")),
                }
            }
            if let Some(rules) = &prop.validation {
                let regex = match rules.regex.as_deref().map(Regex::new).transpose() {
                    Ok(regex) => regex,
                    Err(err) => {
                        causes.push(format!("property \"{name}\" validation regex: {err}"));
                        None
                    }
                };
                let cross = match rules.cross_property.as_deref().map(expr::compile).transpose() {
                    Ok(cross) => cross,
                    Err(err) => {
                        causes.push(format!("property \"{name}\" validation predicate: {err}"));
                        None
                    }
                };
                validations.insert(
                    name.clone(),
                    CompiledValidation {
                        rules: rules.clone(),
                        regex,
                        cross,
                    },
                );
            }
        }

        for (name, node) in &mapping.computed {
            match expr::compile(&node.expression) {
                Ok(compiled) => {
                    computed_exprs.insert(name.clone(), compiled);
                }
                Err(err) => causes.push(format!("computed \"{name}\": {err}")),
            }
        }

        if !causes.is_empty() {
            return Err(MappingError::Invalid { causes });
        }

        Ok(Self {
            mapping,
            computed_order,
            transforms,
            validations,
            computed_exprs,
            computed_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn transforms_of(&self, name: &str) -> &[CompiledTransform] {
        self.transforms.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn validation_of(&self, name: &str) -> Option<&CompiledValidation> {
        self.validations.get(name)
    }

    pub fn computed_expr(&self, name: &str) -> Option<&CompiledExpr> {
        self.computed_exprs.get(name)
    }

    /// Cached result for a node whose dependency values are unchanged.
    pub fn cache_lookup(&self, name: &str, deps: &[Value]) -> Option<Value> {
        let cache = self.computed_cache.lock().unwrap();
        let (cached_deps, value) = cache.get(name)?;
        (cached_deps == deps).then(|| value.clone())
    }

    pub fn cache_store(&self, name: &str, deps: Vec<Value>, value: Value) {
        self.computed_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), (deps, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{
        ComputedNode, Endianness, Platform, Property, PropertyKind, Region, Transform,
    };
    use std::collections::BTreeMap;

    fn mapping_with_bad_expression() -> Mapping {
        let mut properties = BTreeMap::new();
        properties.insert(
            "hp".to_string(),
            Property {
                kind: PropertyKind::U8,
                address: 0xC000,
                width: 1,
                endian: None,
                read_only: false,
                freezable: false,
                default_frozen: false,
                transforms: vec![Transform::Expression("value +".into())],
                validation: None,
                depends_on: vec![],
                description: None,
                hints: None,
            },
        );
        Mapping {
            name: "m".into(),
            game: "g".into(),
            version: String::new(),
            platform: Platform {
                name: "gb".into(),
                endian: Endianness::Little,
                regions: vec![Region {
                    name: "wram".into(),
                    start: 0xC000,
                    end: 0xDFFF,
                }],
            },
            constants: HashMap::new(),
            charmaps: HashMap::new(),
            properties,
            groups: BTreeMap::new(),
            computed: BTreeMap::new(),
            references: HashMap::new(),
            events: None,
            validation: Default::default(),
        }
    }

    #[test]
    fn unparsable_transform_expression_fails_the_load() {
        let err = LoadedMapping::compile(Arc::new(mapping_with_bad_expression())).unwrap_err();
        let MappingError::Invalid { causes } = err else {
            panic!("expected Invalid");
        };
        assert!(causes[0].contains("transform"), "{causes:?}");
    }

    #[test]
    fn computed_cache_hits_only_on_identical_dependency_values() {
        let mut mapping = mapping_with_bad_expression();
        mapping.properties.get_mut("hp").unwrap().transforms = vec![];
        mapping.computed.insert(
            "double".into(),
            ComputedNode {
                expression: "hp * 2".into(),
                dependencies: vec!["hp".into()],
                kind: None,
                cached: true,
            },
        );
        let loaded = LoadedMapping::compile(Arc::new(mapping)).unwrap();

        loaded.cache_store("double", vec![Value::Int(5)], Value::Int(10));
        assert_eq!(
            loaded.cache_lookup("double", &[Value::Int(5)]),
            Some(Value::Int(10))
        );
        assert_eq!(loaded.cache_lookup("double", &[Value::Int(6)]), None);
    }
}
