//! Relationship slots and faults.
//!
//! A relationship value is either a fault (not fetched yet) or resolved.
//! Resolution is an explicit transition performed by the owning context;
//! once resolved, a slot never turns back into a fault unless the context
//! invalidates its object.

use crate::entity::CollectionType;
use crate::object_id::ObjectId;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Capability shared by relationship slots.
pub trait Fault {
    /// `true` until the relationship has been resolved.
    fn is_fault(&self) -> bool;
}

/// Value of a to-one relationship.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ToOne {
    #[default]
    Fault,
    Resolved(Option<ObjectId>),
}

impl ToOne {
    /// Resolved target, or `None` for a fault or a NULL relationship.
    pub fn target(&self) -> Option<&ObjectId> {
        match self {
            ToOne::Resolved(Some(id)) => Some(id),
            _ => None,
        }
    }

    pub fn resolve(&mut self, target: Option<ObjectId>) {
        *self = ToOne::Resolved(target);
    }

    pub fn replace_id(&mut self, old: &ObjectId, new: &ObjectId) {
        if let ToOne::Resolved(Some(id)) = self {
            if id == old {
                *id = new.clone();
            }
        }
    }
}

impl Fault for ToOne {
    fn is_fault(&self) -> bool {
        matches!(self, ToOne::Fault)
    }
}

/// Materialized to-many relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelatedCollection {
    List(Vec<ObjectId>),
    Set(Vec<ObjectId>),
    Map(Vec<(Value, ObjectId)>),
}

impl RelatedCollection {
    pub fn empty(kind: CollectionType) -> Self {
        match kind {
            CollectionType::List => RelatedCollection::List(Vec::new()),
            CollectionType::Set => RelatedCollection::Set(Vec::new()),
            CollectionType::Map => RelatedCollection::Map(Vec::new()),
        }
    }

    pub fn kind(&self) -> CollectionType {
        match self {
            RelatedCollection::List(_) => CollectionType::List,
            RelatedCollection::Set(_) => CollectionType::Set,
            RelatedCollection::Map(_) => CollectionType::Map,
        }
    }

    pub fn ids(&self) -> Vec<&ObjectId> {
        match self {
            RelatedCollection::List(v) | RelatedCollection::Set(v) => v.iter().collect(),
            RelatedCollection::Map(v) => v.iter().map(|(_, id)| id).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RelatedCollection::List(v) | RelatedCollection::Set(v) => v.len(),
            RelatedCollection::Map(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        match self {
            RelatedCollection::List(v) | RelatedCollection::Set(v) => v.contains(id),
            RelatedCollection::Map(v) => v.iter().any(|(_, i)| i == id),
        }
    }

    /// Add a member. Returns `false` if it was already present.
    ///
    /// `key` is only used by map collections; a map entry with an equal key
    /// is replaced.
    pub fn add(&mut self, id: ObjectId, key: Option<Value>) -> bool {
        if self.contains(&id) {
            return false;
        }
        match self {
            RelatedCollection::List(v) | RelatedCollection::Set(v) => v.push(id),
            RelatedCollection::Map(v) => {
                let key = key.unwrap_or(Value::Null);
                v.retain(|(k, _)| !k.key_eq(&key) || key.is_null());
                v.push((key, id));
            }
        }
        true
    }

    /// Remove a member. Returns `false` if it was absent.
    pub fn remove(&mut self, id: &ObjectId) -> bool {
        let before = self.len();
        match self {
            RelatedCollection::List(v) | RelatedCollection::Set(v) => v.retain(|i| i != id),
            RelatedCollection::Map(v) => v.retain(|(_, i)| i != id),
        }
        before != self.len()
    }

    /// Map lookup by key.
    pub fn get_by_key(&self, key: &Value) -> Option<&ObjectId> {
        match self {
            RelatedCollection::Map(v) => v.iter().find(|(k, _)| k.key_eq(key)).map(|(_, id)| id),
            _ => None,
        }
    }

    pub fn replace_id(&mut self, old: &ObjectId, new: &ObjectId) {
        match self {
            RelatedCollection::List(v) | RelatedCollection::Set(v) => {
                for id in v.iter_mut().filter(|id| *id == old) {
                    *id = new.clone();
                }
            }
            RelatedCollection::Map(v) => {
                for (_, id) in v.iter_mut().filter(|(_, id)| id == old) {
                    *id = new.clone();
                }
            }
        }
    }
}

/// Changes made to a to-many relationship before it was resolved.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PendingArcs {
    pub collection: CollectionType,
    pub added: Vec<(ObjectId, Option<Value>)>,
    pub removed: Vec<ObjectId>,
}

/// Value of a to-many relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToMany {
    Fault(PendingArcs),
    Resolved(RelatedCollection),
}

impl ToMany {
    pub fn fault(collection: CollectionType) -> Self {
        ToMany::Fault(PendingArcs {
            collection,
            ..PendingArcs::default()
        })
    }

    pub fn empty(collection: CollectionType) -> Self {
        ToMany::Resolved(RelatedCollection::empty(collection))
    }

    pub fn collection(&self) -> Option<&RelatedCollection> {
        match self {
            ToMany::Resolved(c) => Some(c),
            ToMany::Fault(_) => None,
        }
    }

    pub fn kind(&self) -> CollectionType {
        match self {
            ToMany::Resolved(c) => c.kind(),
            ToMany::Fault(p) => p.collection,
        }
    }

    /// Add a member, queuing it when the relationship is still a fault.
    /// Returns `false` when nothing changed.
    pub fn add(&mut self, id: ObjectId, key: Option<Value>) -> bool {
        match self {
            ToMany::Resolved(c) => c.add(id, key),
            ToMany::Fault(p) => {
                if let Some(pos) = p.removed.iter().position(|r| *r == id) {
                    p.removed.remove(pos);
                    return true;
                }
                if p.added.iter().any(|(a, _)| *a == id) {
                    return false;
                }
                p.added.push((id, key));
                true
            }
        }
    }

    /// Remove a member, queuing it when the relationship is still a fault.
    /// Returns `false` when nothing changed.
    pub fn remove(&mut self, id: &ObjectId) -> bool {
        match self {
            ToMany::Resolved(c) => c.remove(id),
            ToMany::Fault(p) => {
                if let Some(pos) = p.added.iter().position(|(a, _)| a == id) {
                    p.added.remove(pos);
                    return true;
                }
                if p.removed.contains(id) {
                    return false;
                }
                p.removed.push(id.clone());
                true
            }
        }
    }

    /// Replace a fault with fetched members, replaying queued changes.
    /// A resolved relationship is left untouched.
    pub fn resolve(&mut self, mut fetched: RelatedCollection) {
        let ToMany::Fault(pending) = self else {
            return;
        };
        for id in &pending.removed {
            fetched.remove(id);
        }
        for (id, key) in pending.added.drain(..) {
            fetched.add(id, key);
        }
        *self = ToMany::Resolved(fetched);
    }

    /// Resolved copy of this relationship without fetching: a fault becomes
    /// a collection holding only its queued additions.
    pub fn detached(&self) -> ToMany {
        match self {
            ToMany::Resolved(c) => ToMany::Resolved(c.clone()),
            ToMany::Fault(p) => {
                let mut c = RelatedCollection::empty(p.collection);
                for (id, key) in &p.added {
                    c.add(id.clone(), key.clone());
                }
                ToMany::Resolved(c)
            }
        }
    }

    pub fn replace_id(&mut self, old: &ObjectId, new: &ObjectId) {
        match self {
            ToMany::Resolved(c) => c.replace_id(old, new),
            ToMany::Fault(p) => {
                for (id, _) in p.added.iter_mut().filter(|(id, _)| id == old) {
                    *id = new.clone();
                }
                for id in p.removed.iter_mut().filter(|id| *id == old) {
                    *id = new.clone();
                }
            }
        }
    }
}

impl Fault for ToMany {
    fn is_fault(&self) -> bool {
        matches!(self, ToMany::Fault(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Painting", "id", n)
    }

    #[test]
    fn to_one_resolution() {
        let mut slot = ToOne::Fault;
        assert!(slot.is_fault());
        slot.resolve(None);
        assert!(!slot.is_fault());
        assert_eq!(slot.target(), None);
        slot.resolve(Some(id(1)));
        assert_eq!(slot.target(), Some(&id(1)));
    }

    #[test]
    fn queued_changes_replay_on_resolve() {
        let mut slot = ToMany::fault(CollectionType::List);
        assert!(slot.add(id(3), None));
        assert!(slot.remove(&id(1)));
        assert!(!slot.add(id(3), None));

        slot.resolve(RelatedCollection::List(vec![id(1), id(2)]));
        assert!(!slot.is_fault());
        let ids: Vec<_> = slot.collection().unwrap().ids().into_iter().cloned().collect();
        assert_eq!(ids, vec![id(2), id(3)]);
    }

    #[test]
    fn add_then_remove_on_fault_cancels_out() {
        let mut slot = ToMany::fault(CollectionType::Set);
        slot.add(id(1), None);
        slot.remove(&id(1));
        assert_eq!(slot, ToMany::fault(CollectionType::Set));
    }

    #[test]
    fn detached_fault_is_resolved() {
        let mut slot = ToMany::fault(CollectionType::Set);
        slot.add(id(5), None);
        let detached = slot.detached();
        assert!(!detached.is_fault());
        assert_eq!(detached.collection().unwrap().len(), 1);
        assert_eq!(detached.kind(), CollectionType::Set);
    }

    #[test]
    fn map_collections_key_by_value() {
        let mut c = RelatedCollection::empty(CollectionType::Map);
        c.add(id(1), Some(Value::from("a")));
        c.add(id(2), Some(Value::from("b")));
        assert_eq!(c.get_by_key(&Value::from("b")), Some(&id(2)));
        c.add(id(3), Some(Value::from("b")));
        assert_eq!(c.get_by_key(&Value::from("b")), Some(&id(3)));
        assert_eq!(c.len(), 2);
    }
}
