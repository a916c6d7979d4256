//! Schema registry: the typed property tree, its encoded form, and the
//! flattened path view used by queries and path updates.

pub mod codec;
pub mod flatten;
pub mod types;
pub mod validation;

pub use codec::{build_collections, decode, decode_value, encode, encode_value};
pub use flatten::{flatten, FlatNode, FlatSchema};
pub use types::{
    CollectionSchema, LeafNode, Properties, PropertyNode, PropertyType, RemoteRef,
    SchemaDescription, TIMESTAMPS,
};
pub use validation::{apply_nested_properties, apply_properties, type_matches, validate, ValidationReport};
