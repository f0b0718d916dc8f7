use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::CodecError;
use crate::model::ModelObject;

/// Timestamp shape of the `date` tag: encoded as seconds since epoch.
pub type Timestamp = DateTime<Utc>;

/// Wire-level value tags. The set is closed; anything else on the wire is
/// skipped by the appliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Int,
    UInt,
    Float,
    Double,
    Bool,
    String,
    Date,
    Color,
    ModelRef,
    Array,
}

impl TypeTag {
    /// Whether values of this tag point at other model objects.
    pub fn is_reference(&self) -> bool {
        matches!(self, TypeTag::ModelRef | TypeTag::Array)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, TypeTag::Array)
    }
}

/// Runtime shape of a property value.
///
/// References hold the child object itself; the wire form is the child's
/// UUID, resolved against the owning scope on the way in.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
    Date(Timestamp),
    /// RGBA packed as 0xRRGGBBAA.
    Color(u32),
    Ref(Option<Arc<ModelObject>>),
    Array(Vec<Arc<ModelObject>>),
}

impl PropertyValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            PropertyValue::Int(_) => TypeTag::Int,
            PropertyValue::UInt(_) => TypeTag::UInt,
            PropertyValue::Float(_) => TypeTag::Float,
            PropertyValue::Double(_) => TypeTag::Double,
            PropertyValue::Bool(_) => TypeTag::Bool,
            PropertyValue::String(_) => TypeTag::String,
            PropertyValue::Date(_) => TypeTag::Date,
            PropertyValue::Color(_) => TypeTag::Color,
            PropertyValue::Ref(_) => TypeTag::ModelRef,
            PropertyValue::Array(_) => TypeTag::Array,
        }
    }

    /// The value a freshly constructed object holds for a property, and the
    /// value a wire `null` clears back to.
    pub fn default_for(tag: TypeTag) -> PropertyValue {
        match tag {
            TypeTag::Int => PropertyValue::Int(0),
            TypeTag::UInt => PropertyValue::UInt(0),
            TypeTag::Float => PropertyValue::Float(0.0),
            TypeTag::Double => PropertyValue::Double(0.0),
            TypeTag::Bool => PropertyValue::Bool(false),
            TypeTag::String => PropertyValue::String(String::new()),
            TypeTag::Date => PropertyValue::Date(DateTime::<Utc>::UNIX_EPOCH),
            TypeTag::Color => PropertyValue::Color(0),
            TypeTag::ModelRef => PropertyValue::Ref(None),
            TypeTag::Array => PropertyValue::Array(Vec::new()),
        }
    }

    /// The referenced children, if any. Used by the reachability walk.
    pub fn referenced(&self) -> Vec<Arc<ModelObject>> {
        match self {
            PropertyValue::Ref(Some(child)) => vec![child.clone()],
            PropertyValue::Array(children) => children.clone(),
            _ => Vec::new(),
        }
    }
}

/// Scalars compare by value; references compare by identity (UUID).
impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a == b,
            (PropertyValue::UInt(a), PropertyValue::UInt(b)) => a == b,
            (PropertyValue::Float(a), PropertyValue::Float(b)) => a == b,
            (PropertyValue::Double(a), PropertyValue::Double(b)) => a == b,
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a == b,
            (PropertyValue::String(a), PropertyValue::String(b)) => a == b,
            (PropertyValue::Date(a), PropertyValue::Date(b)) => a == b,
            (PropertyValue::Color(a), PropertyValue::Color(b)) => a == b,
            (PropertyValue::Ref(a), PropertyValue::Ref(b)) => {
                a.as_ref().map(|o| o.uuid()) == b.as_ref().map(|o| o.uuid())
            }
            (PropertyValue::Array(a), PropertyValue::Array(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.uuid() == y.uuid())
            }
            _ => false,
        }
    }
}

/// Encodes a runtime value into its wire form. Loss-free for the closed
/// tag set; references encode as UUID strings, collections as arrays of
/// UUID strings (empty collections still encode as `[]`).
pub fn encode(value: &PropertyValue) -> JsonValue {
    match value {
        PropertyValue::Int(v) => JsonValue::from(*v),
        PropertyValue::UInt(v) => JsonValue::from(*v),
        PropertyValue::Float(v) => JsonValue::from(*v as f64),
        PropertyValue::Double(v) => JsonValue::from(*v),
        PropertyValue::Bool(v) => JsonValue::from(*v),
        PropertyValue::String(v) => JsonValue::from(v.clone()),
        PropertyValue::Date(v) => {
            JsonValue::from(v.timestamp_millis() as f64 / 1000.0)
        }
        PropertyValue::Color(v) => JsonValue::from(*v),
        PropertyValue::Ref(None) => JsonValue::Null,
        PropertyValue::Ref(Some(child)) => JsonValue::from(child.uuid().to_string()),
        PropertyValue::Array(children) => JsonValue::from(
            children
                .iter()
                .map(|c| JsonValue::from(c.uuid().to_string()))
                .collect::<Vec<_>>(),
        ),
    }
}

/// Decodes a scalar wire value for the given tag. `null` clears back to the
/// tag default. Reference tags are resolved by the scope, not here; see
/// [`decode_ref_uuids`].
pub fn decode_scalar(tag: TypeTag, value: &JsonValue) -> Result<PropertyValue, CodecError> {
    if value.is_null() {
        return Ok(PropertyValue::default_for(tag));
    }
    let shape_err = || CodecError::Shape {
        tag,
        value: value.to_string(),
    };
    match tag {
        TypeTag::Int => value
            .as_i64()
            .map(PropertyValue::Int)
            .ok_or_else(shape_err),
        TypeTag::UInt => value
            .as_u64()
            .map(PropertyValue::UInt)
            .ok_or_else(shape_err),
        TypeTag::Float => value
            .as_f64()
            .map(|v| PropertyValue::Float(v as f32))
            .ok_or_else(shape_err),
        TypeTag::Double => value
            .as_f64()
            .map(PropertyValue::Double)
            .ok_or_else(shape_err),
        TypeTag::Bool => value
            .as_bool()
            .map(PropertyValue::Bool)
            .ok_or_else(shape_err),
        TypeTag::String => value
            .as_str()
            .map(|v| PropertyValue::String(v.to_owned()))
            .ok_or_else(shape_err),
        TypeTag::Date => {
            let seconds = value.as_f64().ok_or_else(shape_err)?;
            let ts = Utc
                .timestamp_millis_opt((seconds * 1000.0) as i64)
                .single()
                .ok_or_else(shape_err)?;
            Ok(PropertyValue::Date(ts))
        }
        TypeTag::Color => {
            let packed = value.as_u64().ok_or_else(shape_err)?;
            u32::try_from(packed)
                .map(PropertyValue::Color)
                .map_err(|_| shape_err())
        }
        TypeTag::ModelRef | TypeTag::Array => Err(shape_err()),
    }
}

/// The UUIDs a reference-tagged wire value names. Resolution against the
/// scope's index happens in the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUuids {
    One(Option<Uuid>),
    Many(Vec<Uuid>),
}

/// Decodes the UUID payload of a reference tag. `null` clears a single
/// reference; elements of a collection that are not UUID strings fail the
/// whole field.
pub fn decode_ref_uuids(tag: TypeTag, value: &JsonValue) -> Result<RefUuids, CodecError> {
    let shape_err = || CodecError::Shape {
        tag,
        value: value.to_string(),
    };
    match tag {
        TypeTag::ModelRef => {
            if value.is_null() {
                return Ok(RefUuids::One(None));
            }
            let raw = value.as_str().ok_or_else(shape_err)?;
            let uuid = Uuid::parse_str(raw).map_err(|_| shape_err())?;
            Ok(RefUuids::One(Some(uuid)))
        }
        TypeTag::Array => {
            if value.is_null() {
                return Ok(RefUuids::Many(Vec::new()));
            }
            let items = value.as_array().ok_or_else(shape_err)?;
            let mut uuids = Vec::with_capacity(items.len());
            for item in items {
                let raw = item.as_str().ok_or_else(shape_err)?;
                uuids.push(Uuid::parse_str(raw).map_err(|_| shape_err())?);
            }
            Ok(RefUuids::Many(uuids))
        }
        _ => Err(shape_err()),
    }
}
