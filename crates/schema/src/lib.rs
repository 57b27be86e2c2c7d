//! Tavola schema (Milestone 1): parse DescribeFeatureType replies into a
//! compact attribute model and cache them per data-source identity.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fallback spatial attribute when the describe reply names no geometry.
pub const DEFAULT_GEOMETRY_ATTRIBUTE: &str = "the_geom";

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttrType {
    String,
    Int,
    Float,
    Bool,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub attr_type: AttrType,
    pub nillable: bool,
}

/// Feature-type description for one data source: scalar attributes plus the
/// geometry attributes, kept apart the way the grid consumes them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureTypeSchema {
    pub type_name: String,
    pub attributes: Vec<AttributeDescriptor>,
    pub geometry_attributes: Vec<String>,
}

impl FeatureTypeSchema {
    /// First scalar attribute; drives the default sort for paged queries.
    pub fn first_attribute(&self) -> Option<&str> {
        self.attributes.first().map(|a| a.name.as_str())
    }

    /// Spatial attribute used for geometry queries.
    pub fn spatial_attribute(&self) -> &str {
        self.geometry_attributes
            .first()
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_GEOMETRY_ATTRIBUTE)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("feature types are empty")]
    Empty,
    #[error("describe decode: {0}")]
    Decode(String),
}

fn map_attr_type(xsd: &str) -> AttrType {
    // Service replies use prefixed xsd names, e.g. "xsd:string".
    let local = xsd.rsplit(':').next().unwrap_or(xsd);
    match local {
        "int" | "integer" | "long" | "short" | "byte" | "nonNegativeInteger" => AttrType::Int,
        "double" | "float" | "decimal" | "number" => AttrType::Float,
        "boolean" => AttrType::Bool,
        "date" | "dateTime" | "date-time" | "time" => AttrType::Date,
        _ => AttrType::String,
    }
}

fn is_geometry_type(xsd: &str) -> bool {
    xsd.starts_with("gml:")
}

/// Parse a JSON DescribeFeatureType reply
/// (`{"featureTypes":[{"typeName":..,"properties":[{"name","type",..}]}]}`).
pub fn parse_describe(value: &serde_json::Value) -> Result<FeatureTypeSchema, SchemaError> {
    let ft = value
        .get("featureTypes")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .ok_or(SchemaError::Empty)?;
    let type_name = ft
        .get("typeName")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let props = ft
        .get("properties")
        .and_then(|v| v.as_array())
        .ok_or_else(|| SchemaError::Decode("featureTypes[0].properties missing".into()))?;

    let mut attributes = Vec::new();
    let mut geometry_attributes = Vec::new();
    for p in props {
        let name = match p.get("name").and_then(|v| v.as_str()) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };
        let ty = p.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if is_geometry_type(ty) {
            geometry_attributes.push(name);
            continue;
        }
        let nillable = p.get("nillable").and_then(|v| v.as_bool()).unwrap_or(true);
        attributes.push(AttributeDescriptor { name, attr_type: map_attr_type(ty), nillable });
    }
    debug!(type_name = %type_name, attrs = attributes.len(), geoms = geometry_attributes.len(), "schema parsed");
    Ok(FeatureTypeSchema { type_name, attributes, geometry_attributes })
}

/// Single-slot schema cache keyed by data-source identity.
///
/// Same identity → cached schema, no describe. Different identity → the
/// entry is replaced outright, never merged.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entry: Option<(String, Arc<FeatureTypeSchema>)>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> Option<Arc<FeatureTypeSchema>> {
        match &self.entry {
            Some((key, schema)) if key == identity => Some(Arc::clone(schema)),
            _ => None,
        }
    }

    pub fn put(&mut self, identity: impl Into<String>, schema: FeatureTypeSchema) -> Arc<FeatureTypeSchema> {
        let schema = Arc::new(schema);
        self.entry = Some((identity.into(), Arc::clone(&schema)));
        schema
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe_fixture() -> serde_json::Value {
        serde_json::json!({
            "elementFormDefault": "qualified",
            "targetNamespace": "http://www.openplans.org/topp",
            "featureTypes": [{
                "typeName": "states",
                "properties": [
                    {"name": "the_geom", "maxOccurs": 1, "minOccurs": 0, "nillable": true,
                     "type": "gml:MultiPolygon", "localType": "MultiPolygon"},
                    {"name": "STATE_NAME", "nillable": true, "type": "xsd:string", "localType": "string"},
                    {"name": "PERSONS", "nillable": false, "type": "xsd:double", "localType": "double"},
                    {"name": "SAMP_POP", "type": "xsd:int", "localType": "int"}
                ]
            }]
        })
    }

    #[test]
    fn parses_attributes_and_geometry() {
        let schema = parse_describe(&describe_fixture()).unwrap();
        assert_eq!(schema.type_name, "states");
        assert_eq!(schema.geometry_attributes, vec!["the_geom".to_string()]);
        assert_eq!(schema.spatial_attribute(), "the_geom");
        assert_eq!(schema.first_attribute(), Some("STATE_NAME"));
        assert_eq!(schema.attributes.len(), 3);
        assert_eq!(schema.attributes[1].attr_type, AttrType::Float);
        assert!(!schema.attributes[1].nillable);
        assert_eq!(schema.attributes[2].attr_type, AttrType::Int);
    }

    #[test]
    fn defaults_spatial_attribute_when_no_geometry() {
        let v = serde_json::json!({
            "featureTypes": [{"typeName": "t", "properties": [
                {"name": "A", "type": "xsd:string"}
            ]}]
        });
        let schema = parse_describe(&v).unwrap();
        assert_eq!(schema.spatial_attribute(), DEFAULT_GEOMETRY_ATTRIBUTE);
    }

    #[test]
    fn empty_feature_types_is_an_error() {
        let v = serde_json::json!({"featureTypes": []});
        assert!(matches!(parse_describe(&v), Err(SchemaError::Empty)));
    }

    #[test]
    fn cache_serves_same_identity_and_replaces_on_change() {
        let mut cache = SchemaCache::new();
        let schema = parse_describe(&describe_fixture()).unwrap();
        assert!(cache.get("http://a#states").is_none());
        cache.put("http://a#states", schema.clone());
        assert!(cache.get("http://a#states").is_some());
        // Different identity misses and, once stored, evicts the old entry.
        assert!(cache.get("http://b#states").is_none());
        cache.put("http://b#states", schema);
        assert!(cache.get("http://a#states").is_none());
        assert!(cache.get("http://b#states").is_some());
    }
}
