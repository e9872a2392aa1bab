use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::instance::{Instance, Value};

use super::expr::{Predicate, ValueExpr};
use super::types::{Cardinality, EntityDef, FieldType, Operation, Polarity, Rule};

// Raised while the model is built, except that MissingField also surfaces
// at evaluation time when an instance snapshot lacks a declared field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate entity type: {0}")]
    DuplicateEntity(String),

    #[error("duplicate field '{field}' on '{entity}'")]
    DuplicateField { entity: String, field: String },

    #[error("duplicate relation '{relation}' on '{entity}'")]
    DuplicateRelation { entity: String, relation: String },

    #[error("'{name}' is declared as both a field and a relation on '{entity}'")]
    NameClash { entity: String, name: String },

    #[error("entity type not found: {0}")]
    UnknownEntity(String),

    #[error("field '{field}' not found on '{entity}'")]
    UnknownField { entity: String, field: String },

    #[error("relation '{relation}' not found on '{entity}'")]
    UnknownRelation { entity: String, relation: String },

    #[error("delegation cycle through '{0}'")]
    DelegationCycle(String),

    #[error("discriminator field '{field}' on '{entity}' is missing or not string-typed")]
    DiscriminatorInvalid { entity: String, field: String },

    #[error("'{claimed}' does not extend '{base}'")]
    NotASubtype { base: String, claimed: String },

    #[error("relation '{relation}' on '{entity}' must be to-{expected} here")]
    RelationCardinality {
        entity: String,
        relation: String,
        expected: &'static str,
    },

    #[error("check() delegation cycle at '{entity}' for {operation}")]
    CheckCycle {
        entity: String,
        operation: Operation,
    },

    #[error("comparison of {left} against {right} on '{entity}'")]
    TypeMismatch {
        entity: String,
        left: FieldType,
        right: FieldType,
    },

    #[error("rule on '{entity}' names no operations")]
    RuleWithoutOperations { entity: String },

    #[error("future() is only valid at the top level of update rules (entity '{entity}')")]
    FutureOutsideUpdate { entity: String },

    #[error("instance of '{entity}' is missing declared field '{field}'")]
    MissingField { entity: String, field: String },
}

// The label names the declaring entity and the rule's declaration index,
// for reason traces.
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub label: String,
    pub polarity: Polarity,
    pub predicate: Arc<Predicate>,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedRelation {
    pub(crate) target: String,
    pub(crate) cardinality: Cardinality,
}

#[derive(Debug)]
pub(crate) struct ResolvedEntity {
    pub(crate) name: String,
    pub(crate) discriminator: Option<String>,
    // Base chain root first, excluding the entity itself.
    pub(crate) ancestors: Vec<String>,
    // Effective fields and relations, own plus inherited.
    pub(crate) fields: HashMap<String, FieldType>,
    pub(crate) relations: HashMap<String, ResolvedRelation>,
    rules: HashMap<Operation, Vec<ResolvedRule>>,
    field_rules: HashMap<String, HashMap<Operation, Vec<ResolvedRule>>>,
}

const NO_RULES: &[ResolvedRule] = &[];

// Built once, shared read-only behind an Arc across decisions.
#[derive(Debug)]
pub struct PolicyModel {
    entities: HashMap<String, ResolvedEntity>,
}

impl PolicyModel {
    pub fn build(defs: Vec<EntityDef>) -> Result<Self, SchemaError> {
        let mut index: HashMap<&str, &EntityDef> = HashMap::new();
        for def in &defs {
            if index.insert(def.name.as_str(), def).is_some() {
                return Err(SchemaError::DuplicateEntity(def.name.clone()));
            }
        }

        for def in &defs {
            check_local_names(def)?;
        }

        // Delegation chains, root first, including the entity itself last.
        let mut chains: HashMap<&str, Vec<&str>> = HashMap::new();
        for def in &defs {
            chains.insert(def.name.as_str(), chain_of(def, &index)?);
        }

        let mut views: HashMap<&str, View> = HashMap::new();
        for def in &defs {
            views.insert(def.name.as_str(), effective_view(&chains[def.name.as_str()], &index)?);
        }

        for def in &defs {
            for rel in &def.relations {
                if !index.contains_key(rel.target.as_str()) {
                    return Err(SchemaError::UnknownEntity(rel.target.clone()));
                }
            }
            if let Some(ref disc) = def.discriminator {
                let ok = matches!(
                    views[def.name.as_str()].fields.get(disc.as_str()),
                    Some(FieldType::String | FieldType::Id)
                );
                if !ok {
                    return Err(SchemaError::DiscriminatorInvalid {
                        entity: def.name.clone(),
                        field: disc.clone(),
                    });
                }
            }
        }

        for def in &defs {
            for rule in &def.rules {
                validate_rule(&def.name, rule, &views)?;
            }
            for field in &def.fields {
                for rule in &field.overrides {
                    validate_rule(&def.name, rule, &views)?;
                }
            }
        }

        let mut entities = HashMap::new();
        for def in &defs {
            let chain = &chains[def.name.as_str()];
            let view = &views[def.name.as_str()];

            let mut rules: HashMap<Operation, Vec<ResolvedRule>> = HashMap::new();
            let mut field_rules: HashMap<String, HashMap<Operation, Vec<ResolvedRule>>> =
                HashMap::new();
            for origin_name in chain {
                let origin = index[origin_name];
                for (idx, rule) in origin.rules.iter().enumerate() {
                    let resolved = ResolvedRule {
                        label: format!("{origin_name}#{idx}"),
                        polarity: rule.polarity,
                        predicate: Arc::new(rule.predicate.clone()),
                    };
                    for op in &rule.operations {
                        rules.entry(*op).or_default().push(resolved.clone());
                    }
                }
                for field in &origin.fields {
                    for (idx, rule) in field.overrides.iter().enumerate() {
                        let resolved = ResolvedRule {
                            label: format!("{origin_name}.{}#{idx}", field.name),
                            polarity: rule.polarity,
                            predicate: Arc::new(rule.predicate.clone()),
                        };
                        for op in &rule.operations {
                            field_rules
                                .entry(field.name.clone())
                                .or_default()
                                .entry(*op)
                                .or_default()
                                .push(resolved.clone());
                        }
                    }
                }
            }

            let ancestors = chain[..chain.len() - 1]
                .iter()
                .map(|s| s.to_string())
                .collect();
            entities.insert(
                def.name.clone(),
                ResolvedEntity {
                    name: def.name.clone(),
                    discriminator: def.discriminator.clone(),
                    ancestors,
                    fields: view.fields.clone(),
                    relations: view.relations.clone(),
                    rules,
                    field_rules,
                },
            );
        }

        let model = Self { entities };
        model.reject_check_cycles()?;
        Ok(model)
    }

    // Base-chain rules first, then the concrete type's own, in declaration
    // order. An empty slice means default-deny.
    pub fn resolve_rules(
        &self,
        entity: &str,
        operation: Operation,
    ) -> Result<&[ResolvedRule], SchemaError> {
        let ent = self
            .entities
            .get(entity)
            .ok_or_else(|| SchemaError::UnknownEntity(entity.to_string()))?;
        Ok(ent
            .rules
            .get(&operation)
            .map(Vec::as_slice)
            .unwrap_or(NO_RULES))
    }

    // An empty slice means no override: the model-level verdict stands.
    pub fn field_rules(
        &self,
        entity: &str,
        field: &str,
        operation: Operation,
    ) -> Result<&[ResolvedRule], SchemaError> {
        let ent = self
            .entities
            .get(entity)
            .ok_or_else(|| SchemaError::UnknownEntity(entity.to_string()))?;
        if !ent.fields.contains_key(field) {
            return Err(SchemaError::UnknownField {
                entity: entity.to_string(),
                field: field.to_string(),
            });
        }
        Ok(ent
            .field_rules
            .get(field)
            .and_then(|m| m.get(&operation))
            .map(Vec::as_slice)
            .unwrap_or(NO_RULES))
    }

    // For entity types without a discriminator this is the type itself;
    // for a delegating base the discriminator field names the concrete
    // type, which must extend the base.
    pub fn concrete_of(&self, entity: &str, instance: &Instance) -> Result<&str, SchemaError> {
        let ent = self
            .entities
            .get(entity)
            .ok_or_else(|| SchemaError::UnknownEntity(entity.to_string()))?;
        let Some(ref disc) = ent.discriminator else {
            return Ok(&ent.name);
        };

        let value = instance
            .field(disc)
            .ok_or_else(|| SchemaError::MissingField {
                entity: entity.to_string(),
                field: disc.clone(),
            })?;
        let claimed = match value {
            Value::String(s) | Value::Id(s) => s,
            _ => {
                return Err(SchemaError::DiscriminatorInvalid {
                    entity: entity.to_string(),
                    field: disc.clone(),
                });
            }
        };

        let concrete = self
            .entities
            .get(&claimed)
            .ok_or_else(|| SchemaError::UnknownEntity(claimed.clone()))?;
        if concrete.name != ent.name && !concrete.ancestors.contains(&ent.name) {
            return Err(SchemaError::NotASubtype {
                base: ent.name.clone(),
                claimed,
            });
        }
        Ok(&concrete.name)
    }

    pub fn has_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub(crate) fn relation(&self, entity: &str, relation: &str) -> Option<&ResolvedRelation> {
        self.entities.get(entity)?.relations.get(relation)
    }

    // Discriminator field name and declared type, when `entity` delegates.
    pub(crate) fn discriminator_field(&self, entity: &str) -> Option<(&str, FieldType)> {
        let ent = self.entities.get(entity)?;
        let disc = ent.discriminator.as_deref()?;
        let ty = *ent.fields.get(disc)?;
        Some((disc, ty))
    }

    // Every entity extending `base`, directly or transitively. Sorted so
    // compiled filter shapes are deterministic.
    pub(crate) fn subtypes_of(&self, base: &str) -> Vec<&str> {
        let mut subs: Vec<&str> = self
            .entities
            .values()
            .filter(|e| e.ancestors.iter().any(|a| a == base))
            .map(|e| e.name.as_str())
            .collect();
        subs.sort_unstable();
        subs
    }

    // Cyclic check() delegation would recurse forever at evaluation time,
    // so it is rejected here, once, over the resolved rule sets.
    fn reject_check_cycles(&self) -> Result<(), SchemaError> {
        let mut edges: HashMap<(String, Operation), Vec<(String, Operation)>> = HashMap::new();
        let mut names: Vec<&String> = self.entities.keys().collect();
        names.sort();

        for name in &names {
            let ent = &self.entities[*name];
            for op in Operation::ALL {
                let mut targets = Vec::new();
                for rule in ent.rules.get(&op).map(Vec::as_slice).unwrap_or(NO_RULES) {
                    self.collect_check_targets(name, &rule.predicate, &mut targets);
                }
                for per_op in ent.field_rules.values() {
                    for rule in per_op.get(&op).map(Vec::as_slice).unwrap_or(NO_RULES) {
                        self.collect_check_targets(name, &rule.predicate, &mut targets);
                    }
                }
                if !targets.is_empty() {
                    edges.insert((name.to_string(), op), targets);
                }
            }
        }

        let mut done: HashSet<(String, Operation)> = HashSet::new();
        for name in &names {
            for op in Operation::ALL {
                let node = (name.to_string(), op);
                let mut on_path = HashSet::new();
                walk_check_edges(&node, &edges, &mut on_path, &mut done)?;
            }
        }
        Ok(())
    }

    // Collect (entity, operation) pairs reached by check() anywhere in a
    // predicate, tracking how traversal rebinds the current entity.
    fn collect_check_targets(
        &self,
        entity: &str,
        predicate: &Predicate,
        out: &mut Vec<(String, Operation)>,
    ) {
        match predicate {
            Predicate::Const(_) | Predicate::Compare { .. } => {}
            Predicate::And(parts) | Predicate::Or(parts) => {
                for p in parts {
                    self.collect_check_targets(entity, p, out);
                }
            }
            Predicate::Not(inner) => self.collect_check_targets(entity, inner, out),
            Predicate::Exists {
                relation,
                predicate,
            }
            | Predicate::ForAll {
                relation,
                predicate,
            }
            | Predicate::Related {
                relation,
                predicate,
            } => {
                if let Some(rel) = self.relation(entity, relation) {
                    let target = rel.target.clone();
                    self.collect_check_targets(&target, predicate, out);
                }
            }
            Predicate::Check {
                relation,
                operation,
            } => {
                if let Some(rel) = self.relation(entity, relation) {
                    let op = operation.unwrap_or(Operation::Read);
                    // The evaluator routes the fetched row through the
                    // discriminator, so a check on a base type can land in
                    // any subtype's rule set.
                    for sub in self.subtypes_of(&rel.target) {
                        out.push((sub.to_string(), op));
                    }
                    out.push((rel.target.clone(), op));
                }
            }
        }
    }
}

fn walk_check_edges(
    node: &(String, Operation),
    edges: &HashMap<(String, Operation), Vec<(String, Operation)>>,
    on_path: &mut HashSet<(String, Operation)>,
    done: &mut HashSet<(String, Operation)>,
) -> Result<(), SchemaError> {
    if done.contains(node) {
        return Ok(());
    }
    if !on_path.insert(node.clone()) {
        return Err(SchemaError::CheckCycle {
            entity: node.0.clone(),
            operation: node.1,
        });
    }
    for next in edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
        walk_check_edges(next, edges, on_path, done)?;
    }
    on_path.remove(node);
    done.insert(node.clone());
    Ok(())
}

struct View {
    fields: HashMap<String, FieldType>,
    relations: HashMap<String, ResolvedRelation>,
}

fn check_local_names(def: &EntityDef) -> Result<(), SchemaError> {
    let mut fields = HashSet::new();
    // `id` is implicit on every entity.
    fields.insert("id");
    for field in &def.fields {
        if !fields.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField {
                entity: def.name.clone(),
                field: field.name.clone(),
            });
        }
    }
    let mut relations = HashSet::new();
    for rel in &def.relations {
        if !relations.insert(rel.name.as_str()) {
            return Err(SchemaError::DuplicateRelation {
                entity: def.name.clone(),
                relation: rel.name.clone(),
            });
        }
        if fields.contains(rel.name.as_str()) {
            return Err(SchemaError::NameClash {
                entity: def.name.clone(),
                name: rel.name.clone(),
            });
        }
    }
    Ok(())
}

fn chain_of<'a>(
    def: &'a EntityDef,
    index: &HashMap<&'a str, &'a EntityDef>,
) -> Result<Vec<&'a str>, SchemaError> {
    let mut chain = vec![def.name.as_str()];
    let mut seen: HashSet<&str> = chain.iter().copied().collect();
    let mut cur = def;
    while let Some(ref base) = cur.extends {
        let base_def = index
            .get(base.as_str())
            .ok_or_else(|| SchemaError::UnknownEntity(base.clone()))?;
        if !seen.insert(base_def.name.as_str()) {
            return Err(SchemaError::DelegationCycle(def.name.clone()));
        }
        chain.push(base_def.name.as_str());
        cur = base_def;
    }
    chain.reverse();
    Ok(chain)
}

fn effective_view(
    chain: &[&str],
    index: &HashMap<&str, &EntityDef>,
) -> Result<View, SchemaError> {
    let mut fields = HashMap::new();
    fields.insert("id".to_string(), FieldType::Id);
    let mut relations: HashMap<String, ResolvedRelation> = HashMap::new();

    for name in chain {
        let def = index[name];
        for field in &def.fields {
            if fields.insert(field.name.clone(), field.ty).is_some() {
                return Err(SchemaError::DuplicateField {
                    entity: def.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        for rel in &def.relations {
            if fields.contains_key(&rel.name) {
                return Err(SchemaError::NameClash {
                    entity: def.name.clone(),
                    name: rel.name.clone(),
                });
            }
            let resolved = ResolvedRelation {
                target: rel.target.clone(),
                cardinality: rel.cardinality,
            };
            if relations.insert(rel.name.clone(), resolved).is_some() {
                return Err(SchemaError::DuplicateRelation {
                    entity: def.name.clone(),
                    relation: rel.name.clone(),
                });
            }
        }
    }

    Ok(View { fields, relations })
}

fn validate_rule(
    entity: &str,
    rule: &Rule,
    views: &HashMap<&str, View>,
) -> Result<(), SchemaError> {
    if rule.operations.is_empty() {
        return Err(SchemaError::RuleWithoutOperations {
            entity: entity.to_string(),
        });
    }
    let future_ok = rule.operations.iter().all(|op| *op == Operation::Update);
    validate_predicate(entity, &rule.predicate, future_ok, views)
}

fn validate_predicate(
    entity: &str,
    predicate: &Predicate,
    future_ok: bool,
    views: &HashMap<&str, View>,
) -> Result<(), SchemaError> {
    match predicate {
        Predicate::Const(_) => Ok(()),
        Predicate::And(parts) | Predicate::Or(parts) => {
            for p in parts {
                validate_predicate(entity, p, future_ok, views)?;
            }
            Ok(())
        }
        Predicate::Not(inner) => validate_predicate(entity, inner, future_ok, views),
        Predicate::Compare { left, right, .. } => {
            let lt = value_type(entity, left, future_ok, views)?;
            let rt = value_type(entity, right, future_ok, views)?;
            if let (Some(l), Some(r)) = (lt, rt)
                && l != r
            {
                return Err(SchemaError::TypeMismatch {
                    entity: entity.to_string(),
                    left: l,
                    right: r,
                });
            }
            Ok(())
        }
        Predicate::Exists {
            relation,
            predicate,
        }
        | Predicate::ForAll {
            relation,
            predicate,
        } => {
            let target = expect_relation(entity, relation, Cardinality::Many, views)?;
            // future() does not rebind across traversal.
            validate_predicate(target, predicate, false, views)
        }
        Predicate::Related {
            relation,
            predicate,
        } => {
            let target = expect_relation(entity, relation, Cardinality::One, views)?;
            validate_predicate(target, predicate, false, views)
        }
        Predicate::Check { relation, .. } => {
            expect_relation(entity, relation, Cardinality::One, views)?;
            Ok(())
        }
    }
}

fn expect_relation<'v>(
    entity: &str,
    relation: &str,
    expected: Cardinality,
    views: &'v HashMap<&str, View>,
) -> Result<&'v str, SchemaError> {
    let rel = views
        .get(entity)
        .and_then(|v| v.relations.get(relation))
        .ok_or_else(|| SchemaError::UnknownRelation {
            entity: entity.to_string(),
            relation: relation.to_string(),
        })?;
    if rel.cardinality != expected {
        return Err(SchemaError::RelationCardinality {
            entity: entity.to_string(),
            relation: relation.to_string(),
            expected: match expected {
                Cardinality::One => "one",
                Cardinality::Many => "many",
            },
        });
    }
    Ok(&rel.target)
}

// None means untyped (null literal, principal claims), which compares
// against anything.
fn value_type(
    entity: &str,
    expr: &ValueExpr,
    future_ok: bool,
    views: &HashMap<&str, View>,
) -> Result<Option<FieldType>, SchemaError> {
    match expr {
        ValueExpr::Literal(Value::Null) => Ok(None),
        ValueExpr::Literal(Value::Bool(_)) => Ok(Some(FieldType::Bool)),
        ValueExpr::Literal(Value::Int(_)) => Ok(Some(FieldType::Int)),
        ValueExpr::Literal(Value::String(_)) => Ok(Some(FieldType::String)),
        ValueExpr::Literal(Value::Id(_)) => Ok(Some(FieldType::Id)),
        ValueExpr::Field(name) => field_type(entity, name, views).map(Some),
        ValueExpr::FutureField(name) => {
            if !future_ok {
                return Err(SchemaError::FutureOutsideUpdate {
                    entity: entity.to_string(),
                });
            }
            field_type(entity, name, views).map(Some)
        }
        ValueExpr::Auth => Ok(Some(FieldType::Id)),
        ValueExpr::AuthClaim(_) => Ok(None),
        ValueExpr::RelatedId(path) => {
            let mut cur = entity;
            for segment in path {
                cur = expect_relation(cur, segment, Cardinality::One, views)?;
            }
            Ok(Some(FieldType::Id))
        }
    }
}

fn field_type(
    entity: &str,
    field: &str,
    views: &HashMap<&str, View>,
) -> Result<FieldType, SchemaError> {
    views
        .get(entity)
        .and_then(|v| v.fields.get(field))
        .copied()
        .ok_or_else(|| SchemaError::UnknownField {
            entity: entity.to_string(),
            field: field.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::expr::{Predicate, ValueExpr};

    fn user() -> EntityDef {
        EntityDef::new("user").field("email", FieldType::String)
    }

    #[test]
    fn duplicate_entity_rejected() {
        let err = PolicyModel::build(vec![user(), user()]).unwrap_err();

        assert_eq!(err, SchemaError::DuplicateEntity("user".to_string()));
    }

    #[test]
    fn duplicate_field_rejected() {
        let def = EntityDef::new("user")
            .field("email", FieldType::String)
            .field("email", FieldType::String);

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert!(matches!(
            err,
            SchemaError::DuplicateField { ref entity, ref field }
                if entity == "user" && field == "email"
        ));
    }

    #[test]
    fn declaring_the_implicit_id_field_rejected() {
        let def = EntityDef::new("user").field("id", FieldType::Id);

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert!(matches!(err, SchemaError::DuplicateField { ref field, .. } if field == "id"));
    }

    #[test]
    fn relation_to_unknown_entity_rejected() {
        let def = EntityDef::new("post").relation_one("author", "user");

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert_eq!(err, SchemaError::UnknownEntity("user".to_string()));
    }

    #[test]
    fn predicate_over_unknown_relation_rejected() {
        let def = EntityDef::new("org").rule(Rule::allow(
            [Operation::Read],
            Predicate::exists("memberships", Predicate::Const(true)),
        ));

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert!(matches!(
            err,
            SchemaError::UnknownRelation { ref entity, ref relation }
                if entity == "org" && relation == "memberships"
        ));
    }

    #[test]
    fn predicate_over_unknown_field_rejected() {
        let def = EntityDef::new("post").rule(Rule::allow(
            [Operation::Read],
            Predicate::eq(ValueExpr::field("title"), ValueExpr::lit(Value::string("x"))),
        ));

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert!(matches!(
            err,
            SchemaError::UnknownField { ref field, .. } if field == "title"
        ));
    }

    #[test]
    fn quantifier_over_to_one_relation_rejected() {
        let defs = vec![
            user(),
            EntityDef::new("post")
                .relation_one("author", "user")
                .rule(Rule::allow(
                    [Operation::Read],
                    Predicate::exists("author", Predicate::Const(true)),
                )),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(
            err,
            SchemaError::RelationCardinality { expected: "many", .. }
        ));
    }

    #[test]
    fn check_over_to_many_relation_rejected() {
        let defs = vec![
            user(),
            EntityDef::new("org")
                .relation_many("members", "user")
                .rule(Rule::allow([Operation::Read], Predicate::check("members"))),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(
            err,
            SchemaError::RelationCardinality { expected: "one", .. }
        ));
    }

    #[test]
    fn comparison_type_mismatch_rejected() {
        let def = EntityDef::new("post")
            .field("title", FieldType::String)
            .rule(Rule::allow(
                [Operation::Read],
                Predicate::eq(ValueExpr::field("title"), ValueExpr::lit(Value::Int(3))),
            ));

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert_eq!(
            err,
            SchemaError::TypeMismatch {
                entity: "post".to_string(),
                left: FieldType::String,
                right: FieldType::Int,
            }
        );
    }

    #[test]
    fn null_literal_compares_against_any_type() {
        let def = EntityDef::new("post")
            .field("title", FieldType::String)
            .rule(Rule::allow(
                [Operation::Read],
                Predicate::ne(ValueExpr::field("title"), ValueExpr::null()),
            ));

        assert!(PolicyModel::build(vec![def]).is_ok());
    }

    #[test]
    fn future_outside_update_rejected() {
        let def = EntityDef::new("post")
            .field("owner_id", FieldType::Id)
            .rule(Rule::deny(
                [Operation::Read],
                Predicate::ne(ValueExpr::future_field("owner_id"), ValueExpr::auth()),
            ));

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert!(matches!(err, SchemaError::FutureOutsideUpdate { .. }));
    }

    #[test]
    fn future_inside_traversal_rejected() {
        let defs = vec![
            EntityDef::new("org").field("plan", FieldType::String),
            EntityDef::new("post")
                .field("plan", FieldType::String)
                .relation_one("org", "org")
                .rule(Rule::deny(
                    [Operation::Update],
                    Predicate::related(
                        "org",
                        Predicate::eq(
                            ValueExpr::future_field("plan"),
                            ValueExpr::lit(Value::string("free")),
                        ),
                    ),
                )),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(err, SchemaError::FutureOutsideUpdate { .. }));
    }

    #[test]
    fn rule_without_operations_rejected() {
        let def = EntityDef::new("post").rule(Rule::allow(Vec::new(), Predicate::Const(true)));

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert!(matches!(err, SchemaError::RuleWithoutOperations { .. }));
    }

    #[test]
    fn delegation_cycle_rejected() {
        let defs = vec![
            EntityDef::new("a").extends("b"),
            EntityDef::new("b").extends("a"),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(err, SchemaError::DelegationCycle(_)));
    }

    #[test]
    fn discriminator_must_be_a_string_field() {
        let def = EntityDef::new("resource")
            .field("kind", FieldType::Int)
            .discriminator("kind");

        let err = PolicyModel::build(vec![def]).unwrap_err();

        assert!(matches!(err, SchemaError::DiscriminatorInvalid { .. }));
    }

    fn delegated_defs() -> Vec<EntityDef> {
        vec![
            user(),
            EntityDef::new("resource")
                .field("kind", FieldType::String)
                .discriminator("kind")
                .rule(Rule::allow([Operation::Read], Predicate::Const(true))),
            EntityDef::new("post")
                .extends("resource")
                .field("title", FieldType::String)
                .rule(Rule::deny(
                    [Operation::Read],
                    Predicate::eq(
                        ValueExpr::field("title"),
                        ValueExpr::lit(Value::string("secret")),
                    ),
                )),
            EntityDef::new("video").extends("resource"),
        ]
    }

    #[test]
    fn base_rules_are_inherited_by_concrete_types() {
        let model = PolicyModel::build(delegated_defs()).unwrap();

        let post_rules = model.resolve_rules("post", Operation::Read).unwrap();
        let labels: Vec<&str> = post_rules.iter().map(|r| r.label.as_str()).collect();

        assert_eq!(labels, vec!["resource#0", "post#0"]);
    }

    #[test]
    fn concrete_rules_do_not_leak_into_the_base_set() {
        let model = PolicyModel::build(delegated_defs()).unwrap();

        let base_rules = model.resolve_rules("resource", Operation::Read).unwrap();
        let video_rules = model.resolve_rules("video", Operation::Read).unwrap();

        assert_eq!(base_rules.len(), 1);
        assert_eq!(base_rules[0].label, "resource#0");
        assert_eq!(video_rules.len(), 1);
    }

    #[test]
    fn inherited_fields_are_visible_to_concrete_rules() {
        let defs = vec![
            EntityDef::new("resource")
                .field("kind", FieldType::String)
                .discriminator("kind"),
            EntityDef::new("post").extends("resource").rule(Rule::allow(
                [Operation::Read],
                Predicate::eq(
                    ValueExpr::field("kind"),
                    ValueExpr::lit(Value::string("post")),
                ),
            )),
        ];

        assert!(PolicyModel::build(defs).is_ok());
    }

    #[test]
    fn concrete_of_resolves_via_discriminator() {
        let model = PolicyModel::build(delegated_defs()).unwrap();
        let row = Instance::new("resource", "r1").with_field("kind", Value::string("post"));

        assert_eq!(model.concrete_of("resource", &row).unwrap(), "post");
    }

    #[test]
    fn concrete_of_is_identity_without_discriminator() {
        let model = PolicyModel::build(delegated_defs()).unwrap();
        let row = Instance::new("user", "u1");

        assert_eq!(model.concrete_of("user", &row).unwrap(), "user");
    }

    #[test]
    fn concrete_of_rejects_non_subtype() {
        let model = PolicyModel::build(delegated_defs()).unwrap();
        let row = Instance::new("resource", "r1").with_field("kind", Value::string("user"));

        let err = model.concrete_of("resource", &row).unwrap_err();

        assert!(matches!(err, SchemaError::NotASubtype { .. }));
    }

    #[test]
    fn concrete_of_requires_the_discriminator_field() {
        let model = PolicyModel::build(delegated_defs()).unwrap();
        let row = Instance::new("resource", "r1");

        let err = model.concrete_of("resource", &row).unwrap_err();

        assert!(matches!(err, SchemaError::MissingField { ref field, .. } if field == "kind"));
    }

    #[test]
    fn check_cycle_rejected() {
        let defs = vec![
            EntityDef::new("a")
                .relation_one("b", "b")
                .rule(Rule::allow([Operation::Read], Predicate::check("b"))),
            EntityDef::new("b")
                .relation_one("a", "a")
                .rule(Rule::allow([Operation::Read], Predicate::check("a"))),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(
            err,
            SchemaError::CheckCycle {
                operation: Operation::Read,
                ..
            }
        ));
    }

    #[test]
    fn check_self_cycle_rejected() {
        let defs = vec![
            EntityDef::new("folder")
                .relation_one("parent", "folder")
                .rule(Rule::allow([Operation::Read], Predicate::check("parent"))),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(err, SchemaError::CheckCycle { ref entity, .. } if entity == "folder"));
    }

    #[test]
    fn check_chain_across_operations_is_fine() {
        // read delegates to the parent's read; the parent's read rules do
        // not delegate back, so there is no cycle.
        let defs = vec![
            user(),
            EntityDef::new("org")
                .relation_many("members", "user")
                .rule(Rule::allow(
                    [Operation::Read],
                    Predicate::exists(
                        "members",
                        Predicate::eq(ValueExpr::field("id"), ValueExpr::auth()),
                    ),
                )),
            EntityDef::new("project")
                .relation_one("org", "org")
                .rule(Rule::allow([Operation::Read], Predicate::check("org"))),
            EntityDef::new("task")
                .relation_one("project", "project")
                .rule(Rule::allow([Operation::Read], Predicate::check("project"))),
        ];

        assert!(PolicyModel::build(defs).is_ok());
    }

    #[test]
    fn check_inside_quantifier_rebinds_before_edge_collection() {
        // org read -> exists(members as membership) -> check(org) would be a
        // cycle: membership's check targets org:read again.
        let defs = vec![
            EntityDef::new("membership")
                .relation_one("org", "org")
                .rule(Rule::allow([Operation::Read], Predicate::check("org"))),
            EntityDef::new("org")
                .relation_many("memberships", "membership")
                .rule(Rule::allow(
                    [Operation::Read],
                    Predicate::exists("memberships", Predicate::check("org")),
                )),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(err, SchemaError::CheckCycle { .. }));
    }

    #[test]
    fn check_cycle_through_a_discriminated_subtype_rejected() {
        // a's read checks a resource that is a post at runtime, and post's
        // read delegates back to a.
        let defs = vec![
            EntityDef::new("a")
                .relation_one("res", "resource")
                .rule(Rule::allow([Operation::Read], Predicate::check("res"))),
            EntityDef::new("resource")
                .field("kind", FieldType::String)
                .discriminator("kind"),
            EntityDef::new("post")
                .extends("resource")
                .relation_one("owner", "a")
                .rule(Rule::allow([Operation::Read], Predicate::check("owner"))),
        ];

        let err = PolicyModel::build(defs).unwrap_err();

        assert!(matches!(err, SchemaError::CheckCycle { .. }));
    }

    #[test]
    fn unmatched_operation_resolves_to_the_empty_set() {
        let model = PolicyModel::build(delegated_defs()).unwrap();

        assert!(
            model
                .resolve_rules("post", Operation::Delete)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn field_rules_resolve_per_operation() {
        let defs = vec![EntityDef::new("post")
            .field("published", FieldType::Bool)
            .field_rule(
                "published",
                Rule::allow([Operation::Update], Predicate::Const(false)),
            )];
        let model = PolicyModel::build(defs).unwrap();

        let update = model
            .field_rules("post", "published", Operation::Update)
            .unwrap();
        let read = model
            .field_rules("post", "published", Operation::Read)
            .unwrap();

        assert_eq!(update.len(), 1);
        assert_eq!(update[0].label, "post.published#0");
        assert!(read.is_empty());
    }

    #[test]
    fn field_rules_for_unknown_field_error() {
        let model = PolicyModel::build(vec![user()]).unwrap();

        let err = model
            .field_rules("user", "nope", Operation::Read)
            .unwrap_err();

        assert!(matches!(err, SchemaError::UnknownField { .. }));
    }
}
