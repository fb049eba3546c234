//! Schema definition and validation.
//!
//! Schemas define the fields of each collection, which of them hold file
//! attachments, and which secondary indexes the local store must maintain.

use crate::{error::Result, CollectionName, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key path of the item identifier. Every collection is keyed by it.
pub const PRIMARY_KEY_PATH: &str = "id";

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
    /// A file attachment; the stored value is a [`crate::FileRef`]
    File,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
            FieldType::File => write!(f, "File"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Maintain a secondary index on this field
    #[serde(default)]
    pub indexed: bool,
    /// Reject two items with the same value (implies `indexed`)
    #[serde(default)]
    pub unique: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            indexed: false,
            unique: false,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            indexed: false,
            unique: false,
        }
    }

    /// Request a secondary index on this field.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Request a unique secondary index on this field.
    pub fn unique(mut self) -> Self {
        self.indexed = true;
        self.unique = true;
        self
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
            FieldType::File => value.is_object(),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// A secondary index over one key path of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    /// Dot-separated path into the item data, or `createdAt` / `updatedAt`.
    pub key_path: String,
    pub unique: bool,
}

impl IndexDef {
    /// Non-unique index named after its key path.
    pub fn new(key_path: impl Into<String>) -> Self {
        let key_path = key_path.into();
        Self {
            name: key_path.clone(),
            key_path,
            unique: false,
        }
    }

    /// Unique index named after its key path.
    pub fn unique(key_path: impl Into<String>) -> Self {
        Self {
            unique: true,
            ..Self::new(key_path)
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Key paths end up inside SQL identifiers and JSON lookups, so only a
    /// conservative alphabet is accepted.
    pub fn validate(&self) -> Result<()> {
        validate_key_path(&self.key_path)?;
        validate_key_path(&self.name)
    }
}

/// Validate a requested index set. Each definition must be well formed, and
/// a name may repeat only with an identical definition.
pub fn validate_index_set(collection: &str, indexes: &[IndexDef]) -> Result<()> {
    for (position, def) in indexes.iter().enumerate() {
        def.validate()?;
        if let Some(earlier) = indexes[..position].iter().find(|d| d.name == def.name) {
            if earlier != def {
                return Err(Error::SchemaUpgrade {
                    collection: collection.to_string(),
                    reason: format!(
                        "index {} requested over both {} and {}",
                        def.name, earlier.key_path, def.key_path
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Check that `path` is a non-empty dot-separated list of `[A-Za-z0-9_-]+`.
pub fn validate_key_path(path: &str) -> Result<()> {
    let ok = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidKeyPath(path.to_string()))
    }
}

/// Schema for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Indexes declared explicitly, in addition to field hints
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            indexes: Vec::new(),
        }
    }

    /// Builder-style method to declare an extra index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields holding file attachments.
    pub fn file_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::File)
    }

    /// The full desired index set: explicit declarations first, then one
    /// index per hinted field unless an explicit index already claims its
    /// name.
    pub fn index_defs(&self) -> Vec<IndexDef> {
        let mut defs = self.indexes.clone();
        for field in self.fields.iter().filter(|f| f.indexed || f.unique) {
            if defs.iter().any(|d| d.name == field.name) {
                continue;
            }
            defs.push(IndexDef {
                name: field.name.clone(),
                key_path: field.name.clone(),
                unique: field.unique,
            });
        }
        defs
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }
}

/// Schema for the entire store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version of the application data model
    pub version: SchemaVersion,
    /// Collection schemas by name
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: HashMap::new(),
        }
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Get a collection schema or fail with `CollectionNotFound`.
    pub fn collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }
}
