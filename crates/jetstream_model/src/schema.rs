use std::sync::OnceLock;

use dashmap::DashMap;
use tracing::debug;

use crate::value::TypeTag;

/// One declared property of a model class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySchema {
    pub name: &'static str,
    pub tag: TypeTag,
}

impl PropertySchema {
    pub fn is_collection(&self) -> bool {
        self.tag.is_collection()
    }
}

/// The fixed schema of a model class: its wire name, property table, and
/// composite (derived) property table. Declared once per class, usually via
/// [`model_class!`](crate::model_class).
#[derive(Debug, Clone, Copy)]
pub struct ClassSchema {
    pub name: &'static str,
    pub properties: &'static [PropertySchema],
    /// `derived name -> source property names`. A change to any source fires
    /// a change observation for the derived name.
    pub composites: &'static [(&'static str, &'static [&'static str])],
}

impl ClassSchema {
    pub fn property(&self, name: &str) -> Option<&'static PropertySchema> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Derived property names whose source list contains `source`.
    pub fn composites_of<'a>(
        &'a self,
        source: &'a str,
    ) -> impl Iterator<Item = &'static str> + 'a {
        self.composites
            .iter()
            .filter(move |(_, sources)| sources.contains(&source))
            .map(|(derived, _)| *derived)
    }
}

/// Class-name index used to instantiate objects from inbound fragments.
#[derive(Debug)]
pub struct SchemaRegistry {
    classes: DashMap<&'static str, &'static ClassSchema>,
}

impl SchemaRegistry {
    fn new() -> Self {
        SchemaRegistry {
            classes: DashMap::new(),
        }
    }

    /// Registers a class schema. Re-registering the same name replaces the
    /// previous entry.
    pub fn register(&self, schema: &'static ClassSchema) {
        debug!("Registering model class: {}", schema.name);
        self.classes.insert(schema.name, schema);
    }

    pub fn get(&self, name: &str) -> Option<&'static ClassSchema> {
        self.classes.get(name).map(|entry| *entry.value())
    }
}

static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();

/// The process-wide schema registry.
pub fn registry() -> &'static SchemaRegistry {
    REGISTRY.get_or_init(SchemaRegistry::new)
}

/// Declares a model class: a `'static` schema table plus a typed wrapper
/// struct with generated accessors over the dynamic property surface.
///
/// ```ignore
/// model_class! {
///     pub struct Shape {
///         x: double,
///         y: double,
///         color: color,
///         label: string,
///         peer: reference,
///         members: array,
///     }
///     composites {
///         position <- [x, y],
///     }
/// }
/// ```
///
/// Property tags: `int`, `uint`, `float`, `double`, `bool`, `string`,
/// `date`, `color`, `reference`, `array` (ordered collection of references).
#[macro_export]
macro_rules! model_class {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $prop:ident : $tag:ident ),* $(,)?
        }
        $( composites {
            $( $derived:ident <- [ $( $src:ident ),* $(,)? ] ),* $(,)?
        } )?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            inner: ::std::sync::Arc<$crate::model::ModelObject>,
        }

        impl $name {
            pub const NAME: &'static str = stringify!($name);

            pub const SCHEMA: &'static $crate::schema::ClassSchema =
                &$crate::schema::ClassSchema {
                    name: stringify!($name),
                    properties: &[
                        $( $crate::schema::PropertySchema {
                            name: stringify!($prop),
                            tag: $crate::model_class!(@tag $tag),
                        } ),*
                    ],
                    composites: &[
                        $($( (
                            stringify!($derived),
                            &[ $( stringify!($src) ),* ] as &[&'static str],
                        ) ),*)?
                    ],
                };

            /// Registers the class so inbound fragments can instantiate it
            /// by name.
            pub fn register() {
                $crate::schema::registry().register(Self::SCHEMA);
            }

            pub fn new() -> Self {
                Self {
                    inner: $crate::model::ModelObject::new(Self::SCHEMA),
                }
            }

            /// The underlying model object.
            pub fn model(&self) -> &::std::sync::Arc<$crate::model::ModelObject> {
                &self.inner
            }

            pub fn uuid(&self) -> $crate::uuid::Uuid {
                self.inner.uuid()
            }

            $( $crate::model_class!(@accessor $prop : $tag); )*
        }

        impl ::std::default::Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ::std::convert::From<::std::sync::Arc<$crate::model::ModelObject>> for $name {
            fn from(inner: ::std::sync::Arc<$crate::model::ModelObject>) -> Self {
                Self { inner }
            }
        }
    };

    (@tag int) => { $crate::value::TypeTag::Int };
    (@tag uint) => { $crate::value::TypeTag::UInt };
    (@tag float) => { $crate::value::TypeTag::Float };
    (@tag double) => { $crate::value::TypeTag::Double };
    (@tag bool) => { $crate::value::TypeTag::Bool };
    (@tag string) => { $crate::value::TypeTag::String };
    (@tag date) => { $crate::value::TypeTag::Date };
    (@tag color) => { $crate::value::TypeTag::Color };
    (@tag reference) => { $crate::value::TypeTag::ModelRef };
    (@tag array) => { $crate::value::TypeTag::Array };

    (@accessor $prop:ident : int) => {
        $crate::model_class!(@scalar $prop, i64, Int);
    };
    (@accessor $prop:ident : uint) => {
        $crate::model_class!(@scalar $prop, u64, UInt);
    };
    (@accessor $prop:ident : float) => {
        $crate::model_class!(@scalar $prop, f32, Float);
    };
    (@accessor $prop:ident : double) => {
        $crate::model_class!(@scalar $prop, f64, Double);
    };
    (@accessor $prop:ident : bool) => {
        $crate::model_class!(@scalar $prop, bool, Bool);
    };
    (@accessor $prop:ident : string) => {
        $crate::__paste! {
            pub fn $prop(&self) -> ::std::string::String {
                match self.inner.value(stringify!($prop)) {
                    $crate::value::PropertyValue::String(v) => v,
                    other => panic!(
                        "property `{}` holds {:?}", stringify!($prop), other
                    ),
                }
            }

            pub fn [<set_ $prop>](&self, v: impl ::std::convert::Into<::std::string::String>) {
                let _ = self.inner.set_value(
                    stringify!($prop),
                    $crate::value::PropertyValue::String(v.into()),
                );
            }
        }
    };
    (@accessor $prop:ident : date) => {
        $crate::model_class!(@scalar $prop, $crate::value::Timestamp, Date);
    };
    (@accessor $prop:ident : color) => {
        $crate::model_class!(@scalar $prop, u32, Color);
    };
    (@accessor $prop:ident : reference) => {
        $crate::__paste! {
            pub fn $prop(&self)
                -> ::std::option::Option<::std::sync::Arc<$crate::model::ModelObject>>
            {
                match self.inner.value(stringify!($prop)) {
                    $crate::value::PropertyValue::Ref(v) => v,
                    other => panic!(
                        "property `{}` holds {:?}", stringify!($prop), other
                    ),
                }
            }

            pub fn [<set_ $prop>](
                &self,
                v: ::std::option::Option<&::std::sync::Arc<$crate::model::ModelObject>>,
            ) {
                let _ = self.inner.set_value(
                    stringify!($prop),
                    $crate::value::PropertyValue::Ref(v.cloned()),
                );
            }
        }
    };
    (@accessor $prop:ident : array) => {
        $crate::__paste! {
            pub fn $prop(&self) -> ::std::vec::Vec<::std::sync::Arc<$crate::model::ModelObject>> {
                match self.inner.value(stringify!($prop)) {
                    $crate::value::PropertyValue::Array(v) => v,
                    other => panic!(
                        "property `{}` holds {:?}", stringify!($prop), other
                    ),
                }
            }

            pub fn [<set_ $prop>](
                &self,
                v: &[::std::sync::Arc<$crate::model::ModelObject>],
            ) {
                let _ = self.inner.set_value(
                    stringify!($prop),
                    $crate::value::PropertyValue::Array(v.to_vec()),
                );
            }
        }
    };

    (@scalar $prop:ident, $rust:ty, $variant:ident) => {
        $crate::__paste! {
            pub fn $prop(&self) -> $rust {
                match self.inner.value(stringify!($prop)) {
                    $crate::value::PropertyValue::$variant(v) => v,
                    other => panic!(
                        "property `{}` holds {:?}", stringify!($prop), other
                    ),
                }
            }

            pub fn [<set_ $prop>](&self, v: $rust) {
                let _ = self.inner.set_value(
                    stringify!($prop),
                    $crate::value::PropertyValue::$variant(v),
                );
            }
        }
    };
}
