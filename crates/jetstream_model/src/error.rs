use thiserror::Error;
use uuid::Uuid;

use crate::value::TypeTag;

/// Errors raised by the dynamic property surface of a model object.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown property `{property}` on class `{class}`")]
    UnknownProperty {
        property: String,
        class: &'static str,
    },

    #[error("type mismatch on `{property}`: expected a {expected:?} value")]
    TypeMismatch {
        property: String,
        expected: TypeTag,
    },
}

/// Errors raised while decoding wire values.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value `{value}` does not match tag {tag:?}")]
    Shape { tag: TypeTag, value: String },
}

/// Errors raised while applying inbound fragments to a scope.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("no schema registered for class `{0}`")]
    UnknownClass(String),

    #[error("fragment {0} requires a class name but carries none")]
    MissingClass(Uuid),
}
