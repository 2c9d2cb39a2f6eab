//! Merge strategy registry.
//!
//! The domain registers one [`EntityTypeDef`] per entity type at startup.
//! Each definition names the rule used to pick an automatic resolution when
//! two replicas write the same field concurrently, and marks free-text
//! fields that should be merged by a [`TextMerge`] instead.
//!
//! Unregistered entity types fall back to [`ResolutionRule::HashTiebreak`].

use crate::{
    entity::{sort_candidates, value_digest},
    Candidate, EntityType, FieldName, FieldValue, ReplicaId,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Domain-provided resolver for concurrent writes.
///
/// `candidates` always holds at least two entries, sorted in the canonical
/// order shared by every replica. Implementations must be pure functions of
/// their inputs or replicas will diverge.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, field: &str, candidates: &[Candidate]) -> FieldValue;
}

/// Pluggable merge for free-text fields.
///
/// Receives every concurrent version of the field (value plus its clock) and
/// returns a single merged value. Never surfaces a conflict.
pub trait TextMerge: Send + Sync {
    fn merge(&self, field: &str, versions: &[Candidate]) -> FieldValue;
}

/// Keeps every line of every concurrent version.
///
/// Versions are visited in canonical order and each line is emitted the
/// first time it is seen, so the output only depends on the set of versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineUnionMerge;

impl TextMerge for LineUnionMerge {
    fn merge(&self, _field: &str, versions: &[Candidate]) -> FieldValue {
        let mut seen = std::collections::HashSet::new();
        let mut lines = Vec::new();
        for version in versions {
            let text = match &version.value {
                FieldValue::String(s) => s.clone(),
                FieldValue::Null => continue,
                other => other.to_string(),
            };
            for line in text.lines() {
                if seen.insert(line.to_string()) {
                    lines.push(line.to_string());
                }
            }
        }
        FieldValue::String(lines.join("\n"))
    }
}

/// How the automatic resolution of a conflict is chosen.
#[derive(Clone, Default)]
pub enum ResolutionRule {
    /// Highest `(sha256(value), origin_replica)` wins.
    #[default]
    HashTiebreak,
    /// First listed replica wins; unlisted replicas fall back to the hash
    /// tiebreak among themselves.
    ReplicaPriority(Vec<ReplicaId>),
    /// Largest numeric value wins; non-numeric values lose to numbers.
    NumericMax,
    /// Domain-specific rule.
    Custom(Arc<dyn ConflictResolver>),
}

impl fmt::Debug for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionRule::HashTiebreak => write!(f, "HashTiebreak"),
            ResolutionRule::ReplicaPriority(order) => {
                f.debug_tuple("ReplicaPriority").field(order).finish()
            }
            ResolutionRule::NumericMax => write!(f, "NumericMax"),
            ResolutionRule::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ResolutionRule {
    /// Pick the automatic resolution for a set of concurrent candidates.
    ///
    /// Returns the chosen value and the replica credited with it. A custom
    /// resolver that synthesizes a new value is credited to the highest
    /// origin among the candidates.
    pub fn resolve(
        &self,
        field: &str,
        candidates: &[Candidate],
    ) -> Option<(FieldValue, ReplicaId)> {
        let winner = match self {
            ResolutionRule::HashTiebreak => hash_tiebreak(candidates.iter()),
            ResolutionRule::ReplicaPriority(order) => {
                let rank = |c: &Candidate| {
                    order
                        .iter()
                        .position(|r| *r == c.origin_replica)
                        .unwrap_or(order.len())
                };
                let best = candidates.iter().map(rank).min()?;
                hash_tiebreak(candidates.iter().filter(|c| rank(c) == best))
            }
            ResolutionRule::NumericMax => {
                let numbers: Vec<(&Candidate, f64)> = candidates
                    .iter()
                    .filter_map(|c| c.value.as_f64().map(|n| (c, n)))
                    .collect();
                match numbers.iter().map(|(_, n)| *n).reduce(f64::max) {
                    Some(max) => hash_tiebreak(
                        numbers.iter().filter(|(_, n)| *n == max).map(|(c, _)| *c),
                    ),
                    None => hash_tiebreak(candidates.iter()),
                }
            }
            ResolutionRule::Custom(resolver) => {
                let value = resolver.resolve(field, candidates);
                let origin = candidates
                    .iter()
                    .find(|c| c.value == value)
                    .or_else(|| {
                        candidates
                            .iter()
                            .max_by(|a, b| a.origin_replica.cmp(&b.origin_replica))
                    })
                    .map(|c| c.origin_replica.clone())?;
                return Some((value, origin));
            }
        }?;
        Some((winner.value.clone(), winner.origin_replica.clone()))
    }
}

/// Deterministic default: the candidate with the highest value digest, then
/// the highest replica id.
fn hash_tiebreak<'a>(candidates: impl Iterator<Item = &'a Candidate>) -> Option<&'a Candidate> {
    candidates.max_by_key(|c| (value_digest(&c.value), c.origin_replica.clone()))
}

/// How a field is merged when writes race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldKind {
    /// Whole-value resolution with a conflict record.
    #[default]
    Value,
    /// Free text merged by the registry's [`TextMerge`], no conflict record.
    Text,
}

/// Definition of a field with non-default merge behavior.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: FieldName,
    pub kind: FieldKind,
    /// Overrides the entity type's rule for this field
    pub rule: Option<ResolutionRule>,
}

impl FieldDef {
    /// A whole-value field.
    pub fn value(name: impl Into<FieldName>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Value,
            rule: None,
        }
    }

    /// A free-text field.
    pub fn text(name: impl Into<FieldName>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text,
            rule: None,
        }
    }

    /// Use a dedicated resolution rule for this field.
    pub fn with_rule(mut self, rule: ResolutionRule) -> Self {
        self.rule = Some(rule);
        self
    }
}

/// Merge behavior of one entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeDef {
    pub name: EntityType,
    pub rule: ResolutionRule,
    pub fields: Vec<FieldDef>,
}

impl EntityTypeDef {
    /// Create a definition using the default rule and no field overrides.
    pub fn new(name: impl Into<EntityType>) -> Self {
        Self {
            name: name.into(),
            rule: ResolutionRule::default(),
            fields: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: ResolutionRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Get a field definition by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Strategy table keyed by entity type.
#[derive(Clone)]
pub struct StrategyRegistry {
    types: HashMap<EntityType, EntityTypeDef>,
    default_rule: ResolutionRule,
    text_merge: Arc<dyn TextMerge>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self {
            types: HashMap::new(),
            default_rule: ResolutionRule::HashTiebreak,
            text_merge: Arc::new(LineUnionMerge),
        }
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("types", &self.types)
            .field("default_rule", &self.default_rule)
            .finish_non_exhaustive()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type, replacing any earlier definition.
    pub fn register(&mut self, def: EntityTypeDef) {
        self.types.insert(def.name.clone(), def);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_type(mut self, def: EntityTypeDef) -> Self {
        self.register(def);
        self
    }

    /// Replace the free-text merge collaborator.
    pub fn with_text_merge(mut self, text_merge: Arc<dyn TextMerge>) -> Self {
        self.text_merge = text_merge;
        self
    }

    /// Get an entity type definition.
    pub fn get(&self, entity_type: &str) -> Option<&EntityTypeDef> {
        self.types.get(entity_type)
    }

    /// Check if the registry knows an entity type.
    pub fn has_type(&self, entity_type: &str) -> bool {
        self.types.contains_key(entity_type)
    }

    /// Get all registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &EntityType> {
        self.types.keys()
    }

    fn field(&self, entity_type: &str, field: &str) -> Option<&FieldDef> {
        self.get(entity_type).and_then(|def| def.get_field(field))
    }

    /// How a field of the given type is merged.
    pub fn field_kind(&self, entity_type: &str, field: &str) -> FieldKind {
        self.field(entity_type, field)
            .map(|f| f.kind)
            .unwrap_or_default()
    }

    /// Resolution rule for a field, honoring field overrides.
    pub fn rule_for(&self, entity_type: &str, field: &str) -> &ResolutionRule {
        if let Some(rule) = self.field(entity_type, field).and_then(|f| f.rule.as_ref()) {
            return rule;
        }
        self.get(entity_type)
            .map(|def| &def.rule)
            .unwrap_or(&self.default_rule)
    }

    pub fn text_merge(&self) -> &dyn TextMerge {
        self.text_merge.as_ref()
    }

    /// Materialize a set of surviving candidates.
    ///
    /// Candidates are sorted into canonical order first. Text fields go
    /// through the text merge; everything else through the field's rule.
    pub fn materialize(
        &self,
        entity_type: &str,
        field: &str,
        candidates: &mut [Candidate],
    ) -> Option<(FieldValue, ReplicaId)> {
        sort_candidates(candidates);
        match candidates {
            [] => None,
            [only] => Some((only.value.clone(), only.origin_replica.clone())),
            _ => match self.field_kind(entity_type, field) {
                FieldKind::Text => {
                    let value = self.text_merge.merge(field, candidates);
                    let origin = candidates
                        .iter()
                        .map(|c| c.origin_replica.clone())
                        .max()?;
                    Some((value, origin))
                }
                FieldKind::Value => self.rule_for(entity_type, field).resolve(field, candidates),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(origin: &str, value: FieldValue) -> Candidate {
        Candidate::new(origin, value, [(origin, 1)].into_iter().collect())
    }

    #[test]
    fn hash_tiebreak_ignores_input_order() {
        let a = candidate("a", json!(100));
        let b = candidate("b", json!(150));

        let rule = ResolutionRule::HashTiebreak;
        let left = rule.resolve("amount", &[a.clone(), b.clone()]).unwrap();
        let right = rule.resolve("amount", &[b, a]).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn replica_priority() {
        let rule = ResolutionRule::ReplicaPriority(vec!["server".into(), "a".into()]);
        let (value, origin) = rule
            .resolve(
                "amount",
                &[candidate("a", json!(1)), candidate("server", json!(2))],
            )
            .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(origin, "server");
    }

    #[test]
    fn replica_priority_unlisted_falls_back() {
        let rule = ResolutionRule::ReplicaPriority(vec!["server".into()]);
        let candidates = [candidate("x", json!(1)), candidate("y", json!(2))];
        assert_eq!(
            rule.resolve("amount", &candidates),
            ResolutionRule::HashTiebreak.resolve("amount", &candidates)
        );
    }

    #[test]
    fn numeric_max() {
        let rule = ResolutionRule::NumericMax;
        let (value, origin) = rule
            .resolve(
                "amount",
                &[
                    candidate("a", json!(100)),
                    candidate("b", json!(150.5)),
                    candidate("c", json!("n/a")),
                ],
            )
            .unwrap();
        assert_eq!(value, json!(150.5));
        assert_eq!(origin, "b");
    }

    struct Sum;

    impl ConflictResolver for Sum {
        fn resolve(&self, _field: &str, candidates: &[Candidate]) -> FieldValue {
            json!(candidates
                .iter()
                .filter_map(|c| c.value.as_i64())
                .sum::<i64>())
        }
    }

    #[test]
    fn custom_resolver() {
        let rule = ResolutionRule::Custom(Arc::new(Sum));
        let (value, origin) = rule
            .resolve("qty", &[candidate("a", json!(2)), candidate("b", json!(3))])
            .unwrap();
        assert_eq!(value, json!(5));
        assert_eq!(origin, "b");
    }

    #[test]
    fn line_union_merge() {
        let merged = LineUnionMerge.merge(
            "memo",
            &[
                candidate("a", json!("lunch\nwith client")),
                candidate("b", json!("lunch\nreceipt attached")),
            ],
        );
        assert_eq!(merged, json!("lunch\nwith client\nreceipt attached"));
    }

    #[test]
    fn registry_lookup() {
        let registry = StrategyRegistry::new().with_type(
            EntityTypeDef::new("transaction")
                .with_rule(ResolutionRule::NumericMax)
                .with_field(FieldDef::text("memo"))
                .with_field(FieldDef::value("payee").with_rule(ResolutionRule::HashTiebreak)),
        );

        assert!(registry.has_type("transaction"));
        assert_eq!(registry.field_kind("transaction", "memo"), FieldKind::Text);
        assert_eq!(registry.field_kind("transaction", "amount"), FieldKind::Value);
        assert!(matches!(
            registry.rule_for("transaction", "amount"),
            ResolutionRule::NumericMax
        ));
        assert!(matches!(
            registry.rule_for("transaction", "payee"),
            ResolutionRule::HashTiebreak
        ));
        assert!(matches!(
            registry.rule_for("invoice", "total"),
            ResolutionRule::HashTiebreak
        ));
    }

    #[test]
    fn materialize_sorts_candidates() {
        let registry = StrategyRegistry::new()
            .with_type(EntityTypeDef::new("note").with_field(FieldDef::text("body")));

        let mut left = vec![candidate("b", json!("two")), candidate("a", json!("one"))];
        let mut right = vec![candidate("a", json!("one")), candidate("b", json!("two"))];

        let l = registry.materialize("note", "body", &mut left).unwrap();
        let r = registry.materialize("note", "body", &mut right).unwrap();
        assert_eq!(l, r);
        assert_eq!(l.0, json!("one\ntwo"));
        assert_eq!(left, right);
    }
}
