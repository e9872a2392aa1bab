use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use relgate_core::engine::{AccessError, GraphAccessor};
use relgate_core::{CompareOp, Filter, Instance, InstanceRef, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Link {
    from: InstanceRef,
    relation: String,
    to: InstanceRef,
}

#[derive(Debug)]
struct InnerState {
    instances: HashMap<InstanceRef, Instance>,
    links: Vec<Link>,
}

// Instances keyed by identity, relations as an explicit edge list. Backs
// tests and small deployments; a production accessor would wrap a
// database and translate push-down filters into queries.
#[derive(Debug, Clone)]
pub struct InMemoryGraph {
    state: Arc<Mutex<InnerState>>,
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InnerState {
                instances: HashMap::new(),
                links: Vec::new(),
            })),
        }
    }

    pub fn insert(&self, instance: Instance) {
        let mut state = self.state.lock().unwrap();
        state.instances.insert(instance.instance_ref(), instance);
    }

    pub fn get(&self, at: &InstanceRef) -> Option<Instance> {
        self.state.lock().unwrap().instances.get(at).cloned()
    }

    // Idempotent for identical edges.
    pub fn link(&self, from: &InstanceRef, relation: impl Into<String>, to: &InstanceRef) {
        let link = Link {
            from: from.clone(),
            relation: relation.into(),
            to: to.clone(),
        };
        let mut state = self.state.lock().unwrap();
        if !state.links.contains(&link) {
            state.links.push(link);
        }
    }

    pub fn unlink(&self, from: &InstanceRef, relation: &str, to: &InstanceRef) {
        let mut state = self.state.lock().unwrap();
        state
            .links
            .retain(|l| !(l.from == *from && l.relation == relation && l.to == *to));
    }

    // Every instance of `entity_type` matching the push-down filter; the
    // reference semantics a translating accessor must reproduce.
    pub fn select(&self, entity_type: &str, filter: &Filter) -> Vec<Instance> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| i.entity_type == entity_type && state.matches(i, filter))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

impl InnerState {
    fn related_refs<'a>(
        &'a self,
        from: &'a InstanceRef,
        relation: &'a str,
    ) -> impl Iterator<Item = &'a InstanceRef> {
        self.links
            .iter()
            .filter(move |l| l.from == *from && l.relation == relation)
            .map(|l| &l.to)
    }

    fn matches(&self, instance: &Instance, filter: &Filter) -> bool {
        match filter {
            Filter::Any => true,
            Filter::Empty => false,
            Filter::Compare { field, op, value } => match instance.field(field) {
                None | Some(Value::Null) => false,
                Some(actual) => match op {
                    CompareOp::Eq => actual == *value,
                    CompareOp::Ne => actual != *value,
                },
            },
            Filter::IsNull { field } => {
                matches!(instance.field(field), None | Some(Value::Null))
            }
            Filter::And(parts) => parts.iter().all(|f| self.matches(instance, f)),
            Filter::Or(parts) => parts.iter().any(|f| self.matches(instance, f)),
            Filter::Not(inner) => !self.matches(instance, inner),
            Filter::SomeRelated { relation, filter } => self
                .related_refs(&instance.instance_ref(), relation)
                .filter_map(|to| self.instances.get(to))
                .any(|related| self.matches(related, filter)),
            Filter::AllRelated { relation, filter } => self
                .related_refs(&instance.instance_ref(), relation)
                .filter_map(|to| self.instances.get(to))
                .all(|related| self.matches(related, filter)),
            Filter::OneRelated { relation, filter } => self
                .related_refs(&instance.instance_ref(), relation)
                .next()
                .and_then(|to| self.instances.get(to))
                .is_some_and(|related| self.matches(related, filter)),
        }
    }
}

impl GraphAccessor for InMemoryGraph {
    async fn related_one(
        &self,
        from: &InstanceRef,
        relation: &str,
    ) -> Result<Option<Instance>, AccessError> {
        let state = self.state.lock().unwrap();
        match state.related_refs(from, relation).next() {
            None => Ok(None),
            Some(to) => state
                .instances
                .get(to)
                .cloned()
                .map(Some)
                .ok_or_else(|| AccessError::Internal(format!("dangling link to {to}"))),
        }
    }

    async fn related_many(
        &self,
        from: &InstanceRef,
        relation: &str,
    ) -> Result<Vec<Instance>, AccessError> {
        let state = self.state.lock().unwrap();
        state
            .related_refs(from, relation)
            .map(|to| {
                state
                    .instances
                    .get(to)
                    .cloned()
                    .ok_or_else(|| AccessError::Internal(format!("dangling link to {to}")))
            })
            .collect()
    }
}
