use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::ModelError;
use crate::lock;
use crate::schema::ClassSchema;
use crate::scope::Scope;
use crate::signal::Signal;
use crate::value::{self, PropertyValue};

/// A property change observation. `old`/`new` are `None` for composite
/// (derived) properties, whose value is re-evaluated lazily on read.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub property: &'static str,
    pub old: Option<PropertyValue>,
    pub new: Option<PropertyValue>,
}

/// Membership delta of a collection-of-references property.
#[derive(Debug, Clone)]
pub struct CollectionChange {
    pub property: &'static str,
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

/// A weak back-reference: one entry per live parent -> child link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub parent: Uuid,
    pub property: &'static str,
}

struct ObjectState {
    values: HashMap<&'static str, PropertyValue>,
    parents: Vec<ParentLink>,
    scope: Option<Weak<Scope>>,
}

/// An observable entity participating in synchronization.
///
/// Identity is the UUID, assigned at construction and serialized on the
/// wire: two model objects are the same iff they share a UUID. An object
/// belongs to at most one scope at a time.
pub struct ModelObject {
    uuid: Uuid,
    schema: &'static ClassSchema,
    weak_self: Weak<ModelObject>,
    state: Mutex<ObjectState>,
    on_change: Signal<PropertyChange>,
    on_collection: Signal<CollectionChange>,
    on_detach: Signal<Uuid>,
}

impl ModelObject {
    pub fn new(schema: &'static ClassSchema) -> Arc<Self> {
        Self::with_uuid(schema, Uuid::new_v4())
    }

    /// Constructs an object with a known identity. Used when instantiating
    /// from inbound fragments.
    pub fn with_uuid(schema: &'static ClassSchema, uuid: Uuid) -> Arc<Self> {
        let values = schema
            .properties
            .iter()
            .map(|p| (p.name, PropertyValue::default_for(p.tag)))
            .collect();
        Arc::new_cyclic(|weak: &Weak<ModelObject>| ModelObject {
            uuid,
            schema,
            weak_self: weak.clone(),
            state: Mutex::new(ObjectState {
                values,
                parents: Vec::new(),
                scope: None,
            }),
            on_change: Signal::new(),
            on_collection: Signal::new(),
            on_detach: Signal::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn schema(&self) -> &'static ClassSchema {
        self.schema
    }

    pub fn class_name(&self) -> &'static str {
        self.schema.name
    }

    /// Per-property change observations.
    pub fn on_change(&self) -> &Signal<PropertyChange> {
        &self.on_change
    }

    /// Collection add/remove observations for array properties.
    pub fn on_collection(&self) -> &Signal<CollectionChange> {
        &self.on_collection
    }

    /// Fired once when the object leaves its scope.
    pub fn on_detach(&self) -> &Signal<Uuid> {
        &self.on_detach
    }

    /// The scope currently containing this object, if any.
    pub fn scope(&self) -> Option<Arc<Scope>> {
        lock(&self.state).scope.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_scope(&self, scope: Option<Weak<Scope>>) {
        lock(&self.state).scope = scope;
    }

    /// Current parent back-references, one entry per live link.
    pub fn parents(&self) -> Vec<ParentLink> {
        lock(&self.state).parents.clone()
    }

    pub(crate) fn add_parent(&self, parent: Uuid, property: &'static str) {
        lock(&self.state).parents.push(ParentLink { parent, property });
    }

    /// Removes exactly one matching back-reference entry.
    pub(crate) fn remove_parent(&self, parent: Uuid, property: &'static str) {
        let mut state = lock(&self.state);
        if let Some(pos) = state
            .parents
            .iter()
            .position(|l| l.parent == parent && l.property == property)
        {
            state.parents.remove(pos);
        }
    }

    /// Current value of a declared property.
    ///
    /// Panics if `name` is not in the class schema; use [`try_value`]
    /// for dynamic access.
    ///
    /// [`try_value`]: ModelObject::try_value
    pub fn value(&self, name: &str) -> PropertyValue {
        match self.try_value(name) {
            Some(v) => v,
            None => panic!(
                "class `{}` declares no property `{}`",
                self.schema.name, name
            ),
        }
    }

    pub fn try_value(&self, name: &str) -> Option<PropertyValue> {
        let prop = self.schema.property(name)?;
        Some(
            lock(&self.state)
                .values
                .get(prop.name)
                .cloned()
                .unwrap_or_else(|| PropertyValue::default_for(prop.tag)),
        )
    }

    /// Sets a property, running the full change-capture pipeline: equality
    /// no-op, parent back-pointer maintenance, change/collection/composite
    /// observations, and scope capture (suppressed while the scope is
    /// applying remote fragments). Returns whether the value changed.
    pub fn set_value(&self, name: &str, new: PropertyValue) -> Result<bool, ModelError> {
        let prop = self
            .schema
            .property(name)
            .ok_or_else(|| ModelError::UnknownProperty {
                property: name.to_owned(),
                class: self.schema.name,
            })?;
        if new.tag() != prop.tag {
            return Err(ModelError::TypeMismatch {
                property: name.to_owned(),
                expected: prop.tag,
            });
        }
        let name = prop.name;

        // Swap the stored value; release the lock before touching children
        // so a self-reference cannot deadlock.
        let (old, scope) = {
            let mut state = lock(&self.state);
            let old = state
                .values
                .get(name)
                .cloned()
                .unwrap_or_else(|| PropertyValue::default_for(prop.tag));
            if old == new {
                return Ok(false);
            }
            state.values.insert(name, new.clone());
            (old, state.scope.clone())
        };

        // Back-pointer maintenance on the children that left and joined.
        let (added, removed) = reference_delta(&old, &new);
        for child in &removed {
            child.remove_parent(self.uuid, name);
        }
        for child in &added {
            child.add_parent(self.uuid, name);
        }

        let change = PropertyChange {
            property: name,
            old: Some(old),
            new: Some(new),
        };
        let collection = (prop.is_collection() && !(added.is_empty() && removed.is_empty()))
            .then(|| CollectionChange {
                property: name,
                added: added.iter().map(|c| c.uuid()).collect(),
                removed: removed.iter().map(|c| c.uuid()).collect(),
            });

        let scope = scope.as_ref().and_then(Weak::upgrade);
        match scope {
            Some(ref s) if s.is_applying_remote() => {
                // Observations are batched and fired at the step boundary.
                if let Some(me) = self.weak_self.upgrade() {
                    s.defer_change(&me, change);
                    if let Some(c) = collection {
                        s.defer_collection(&me, c);
                    }
                }
            }
            _ => {
                self.emit_change(&change);
                if let Some(c) = collection {
                    self.on_collection.fire(&c);
                }
            }
        }

        if let Some(s) = scope {
            if !s.is_applying_remote() {
                s.record_change(self.uuid, name);
            }
        }
        Ok(true)
    }

    /// Fires the per-property observation plus one observation per derived
    /// property whose sources include it.
    pub(crate) fn emit_change(&self, change: &PropertyChange) {
        self.on_change.fire(change);
        for derived in self.schema.composites_of(change.property) {
            self.on_change.fire(&PropertyChange {
                property: derived,
                old: None,
                new: None,
            });
        }
    }

    pub(crate) fn emit_collection(&self, change: &CollectionChange) {
        self.on_collection.fire(change);
    }

    /// Children referenced by this object's properties, in schema order.
    pub(crate) fn referenced_children(&self) -> Vec<Arc<ModelObject>> {
        let state = lock(&self.state);
        let mut children = Vec::new();
        for prop in self.schema.properties {
            if let Some(v) = state.values.get(prop.name) {
                children.extend(v.referenced());
            }
        }
        children
    }

    /// Wire encoding of a single property.
    pub(crate) fn encoded_value(&self, name: &'static str) -> Option<JsonValue> {
        lock(&self.state).values.get(name).map(value::encode)
    }

    /// Detaches from the owning scope, firing the detach observation.
    pub(crate) fn detach(&self) {
        lock(&self.state).scope = None;
        self.on_detach.fire(&self.uuid);
    }
}

/// The children joining and leaving a reference-valued property.
fn reference_delta(
    old: &PropertyValue,
    new: &PropertyValue,
) -> (Vec<Arc<ModelObject>>, Vec<Arc<ModelObject>>) {
    let before = old.referenced();
    let after = new.referenced();
    let added = after
        .iter()
        .filter(|c| !before.iter().any(|p| p.uuid() == c.uuid()))
        .cloned()
        .collect();
    let removed = before
        .iter()
        .filter(|c| !after.iter().any(|p| p.uuid() == c.uuid()))
        .cloned()
        .collect();
    (added, removed)
}

impl PartialEq for ModelObject {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for ModelObject {}

impl std::hash::Hash for ModelObject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl std::fmt::Debug for ModelObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelObject")
            .field("class", &self.schema.name)
            .field("uuid", &self.uuid)
            .finish()
    }
}
