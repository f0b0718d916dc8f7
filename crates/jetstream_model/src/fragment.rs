use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::model::ModelObject;

/// Operation a fragment describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Add,
    Change,
    Root,
}

/// The wire record for one object's delta: an `add` carries the class name
/// and a full property snapshot, a `change` carries only the changed
/// properties, a `root` installs or replaces the scope root.
///
/// An absent or `null` property value means "clear".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFragment {
    #[serde(rename = "type")]
    pub kind: FragmentKind,
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cls: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub properties: Option<Map<String, JsonValue>>,
}

impl SyncFragment {
    /// An `add` for an object that became reachable: class name plus the
    /// full current property snapshot.
    pub fn add(object: &ModelObject) -> Self {
        SyncFragment {
            kind: FragmentKind::Add,
            uuid: object.uuid(),
            cls: Some(object.class_name().to_owned()),
            properties: Some(snapshot(object)),
        }
    }

    /// A `root` naming the (new) scope root. Carries the full snapshot so
    /// the receiver can reconcile the root's own properties.
    pub fn root(object: &ModelObject) -> Self {
        SyncFragment {
            kind: FragmentKind::Root,
            uuid: object.uuid(),
            cls: Some(object.class_name().to_owned()),
            properties: Some(snapshot(object)),
        }
    }

    /// A `change` carrying only the named properties.
    pub fn change(object: &ModelObject, changed: &HashSet<&'static str>) -> Self {
        let mut properties = Map::new();
        for prop in object.schema().properties {
            if !changed.contains(prop.name) {
                continue;
            }
            if let Some(encoded) = object.encoded_value(prop.name) {
                properties.insert(prop.name.to_owned(), encoded);
            }
        }
        SyncFragment {
            kind: FragmentKind::Change,
            uuid: object.uuid(),
            cls: None,
            properties: Some(properties),
        }
    }

    /// Property names carried by this fragment.
    pub fn property_names(&self) -> Vec<&str> {
        self.properties
            .as_ref()
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Full wire snapshot of every declared property, in schema order.
fn snapshot(object: &ModelObject) -> Map<String, JsonValue> {
    let mut properties = Map::new();
    for prop in object.schema().properties {
        if let Some(encoded) = object.encoded_value(prop.name) {
            properties.insert(prop.name.to_owned(), encoded);
        }
    }
    properties
}
