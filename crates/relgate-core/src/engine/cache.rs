use std::collections::HashMap;
use std::sync::Mutex;

use crate::instance::{Instance, InstanceRef};

use super::{AccessError, GraphAccessor};

// Memoizes graph fetches for the lifetime of one decision. Built fresh
// per decide call; caching across decisions would leak results across
// actors and snapshots.
pub(crate) struct FetchCache<'a, A> {
    accessor: &'a A,
    one: Mutex<HashMap<(InstanceRef, String), Option<Instance>>>,
    many: Mutex<HashMap<(InstanceRef, String), Vec<Instance>>>,
}

impl<'a, A: GraphAccessor> FetchCache<'a, A> {
    pub(crate) fn new(accessor: &'a A) -> Self {
        Self {
            accessor,
            one: Mutex::new(HashMap::new()),
            many: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn related_one(
        &self,
        from: &InstanceRef,
        relation: &str,
    ) -> Result<Option<Instance>, AccessError> {
        let key = (from.clone(), relation.to_string());
        if let Some(hit) = self.one.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }
        let fetched = self.accessor.related_one(from, relation).await?;
        self.one.lock().unwrap().insert(key, fetched.clone());
        Ok(fetched)
    }

    pub(crate) async fn related_many(
        &self,
        from: &InstanceRef,
        relation: &str,
    ) -> Result<Vec<Instance>, AccessError> {
        let key = (from.clone(), relation.to_string());
        if let Some(hit) = self.many.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }
        let fetched = self.accessor.related_many(from, relation).await?;
        self.many.lock().unwrap().insert(key, fetched.clone());
        Ok(fetched)
    }
}
