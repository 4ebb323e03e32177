//! Native Module ABI
//!
//! A shared library becomes a module by exporting these C symbols:
//!
//! ```text
//! u32          modgate_abi_version(void);
//! const char*  modgate_describe(void);                       // JSON ModuleDescriptor
//! i32          modgate_construct(const char* type, void** handle, char** error);
//! i32          modgate_invoke(const char* type, const char* method, void* handle,
//!                             const char* args_json, char** result_json, char** error);
//! void         modgate_release(const char* type, void* handle);
//! void         modgate_free_string(char* s);
//! ```
//!
//! Status codes are 0 for success and non-zero for a fault raised by the
//! module's own code; `error` then holds a message owned by the module.
//! `args_json` is a JSON array: primitive arguments as strings, structures as
//! objects, absent structures as `null`. A null `result_json` means no value.

use std::collections::HashMap;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::{FieldDef, PrimitiveKind, StructSchema, TypeRef};

/// ABI revision the host speaks
pub const ABI_VERSION: u32 = 1;

pub(crate) const SYM_ABI_VERSION: &[u8] = b"modgate_abi_version\0";
pub(crate) const SYM_DESCRIBE: &[u8] = b"modgate_describe\0";
pub(crate) const SYM_CONSTRUCT: &[u8] = b"modgate_construct\0";
pub(crate) const SYM_INVOKE: &[u8] = b"modgate_invoke\0";
pub(crate) const SYM_RELEASE: &[u8] = b"modgate_release\0";
pub(crate) const SYM_FREE_STRING: &[u8] = b"modgate_free_string\0";

pub(crate) type AbiVersionFn = unsafe extern "C" fn() -> u32;
pub(crate) type DescribeFn = unsafe extern "C" fn() -> *const c_char;
pub(crate) type ConstructFn =
    unsafe extern "C" fn(*const c_char, *mut *mut c_void, *mut *mut c_char) -> i32;
pub(crate) type InvokeFn = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    *mut c_void,
    *const c_char,
    *mut *mut c_char,
    *mut *mut c_char,
) -> i32;
pub(crate) type ReleaseFn = unsafe extern "C" fn(*const c_char, *mut c_void);
pub(crate) type FreeStringFn = unsafe extern "C" fn(*mut c_char);

/// Module descriptor returned by `modgate_describe`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Invocable types
    #[serde(default)]
    pub types: Vec<TypeDescriptor>,

    /// Structured parameter/return types referenced by name
    #[serde(default)]
    pub structs: Vec<StructDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,

    #[serde(default = "default_true")]
    pub public: bool,

    /// Whether `modgate_construct` can build a receiver for this type
    #[serde(default)]
    pub constructible: bool,

    /// Methods in declaration order
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,

    /// Parameter type names in declaration order
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default = "default_returns")]
    pub returns: String,

    #[serde(default, rename = "static")]
    pub is_static: bool,

    #[serde(default = "default_true")]
    pub public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDescriptor {
    pub name: String,

    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,

    /// Type name; a trailing `?` marks the field nullable
    #[serde(rename = "type")]
    pub ty: String,

    #[serde(default = "default_true")]
    pub writable: bool,
}

fn default_true() -> bool {
    true
}

fn default_returns() -> String {
    "void".to_string()
}

impl ModuleDescriptor {
    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("malformed module descriptor: {}", e))
    }

    /// Resolve a type name against the built-in kinds and this descriptor's structs
    pub fn resolve_type(&self, name: &str) -> Result<TypeRef, String> {
        let mut cache = HashMap::new();
        self.resolve_with(name, &mut cache, &mut Vec::new())
    }

    fn resolve_with(
        &self,
        name: &str,
        cache: &mut HashMap<String, Arc<StructSchema>>,
        visiting: &mut Vec<String>,
    ) -> Result<TypeRef, String> {
        let name = name.trim().trim_end_matches('?');
        if name.eq_ignore_ascii_case("void") {
            return Ok(TypeRef::Void);
        }
        if let Some(kind) = PrimitiveKind::from_name(name) {
            return Ok(TypeRef::Primitive(kind));
        }
        if let Some(schema) = cache.get(name) {
            return Ok(TypeRef::Struct(Arc::clone(schema)));
        }
        if visiting.iter().any(|v| v == name) {
            return Err(format!("structure '{}' contains itself", name));
        }

        let desc = self
            .structs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| format!("unknown type '{}'", name))?;

        visiting.push(name.to_string());
        let mut fields = Vec::with_capacity(desc.fields.len());
        for field in &desc.fields {
            let ty = self.resolve_with(&field.ty, cache, visiting)?;
            let mut def = FieldDef::new(field.name.clone(), ty);
            if field.ty.trim().ends_with('?') {
                def = def.nullable();
            }
            if !field.writable {
                def = def.read_only();
            }
            fields.push(def);
        }
        visiting.pop();

        let schema = Arc::new(StructSchema::new(name, fields));
        cache.insert(name.to_string(), Arc::clone(&schema));
        Ok(TypeRef::Struct(schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "types": [
            {
                "name": "Quality.Reports",
                "constructible": true,
                "methods": [
                    { "name": "Echo", "params": ["string"], "returns": "string", "static": true },
                    { "name": "Report", "params": ["Quality.Filter"], "returns": "string" }
                ]
            }
        ],
        "structs": [
            {
                "name": "Quality.Filter",
                "fields": [
                    { "name": "SP", "type": "string" },
                    { "name": "IsBI", "type": "bool" },
                    { "name": "Start", "type": "DateTime?" },
                    { "name": "Id", "type": "int", "writable": false }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_descriptor() {
        let desc = ModuleDescriptor::from_json(DESCRIPTOR).unwrap();
        assert_eq!(desc.types.len(), 1);
        let ty = &desc.types[0];
        assert!(ty.public);
        assert!(ty.constructible);
        assert_eq!(ty.methods[0].name, "Echo");
        assert!(ty.methods[0].is_static);
        assert!(!ty.methods[1].is_static);
        assert_eq!(ty.methods[1].returns, "string");
    }

    #[test]
    fn test_resolve_struct_type() {
        let desc = ModuleDescriptor::from_json(DESCRIPTOR).unwrap();
        let ty = desc.resolve_type("Quality.Filter").unwrap();
        let TypeRef::Struct(schema) = ty else {
            panic!("expected a structure");
        };
        assert_eq!(schema.fields.len(), 4);
        assert!(schema.field("SP").unwrap().nullable);
        assert!(!schema.field("IsBI").unwrap().nullable);
        assert!(schema.field("Start").unwrap().nullable);
        assert!(!schema.field("Id").unwrap().writable);
    }

    #[test]
    fn test_resolve_primitives_and_void() {
        let desc = ModuleDescriptor::default();
        assert!(desc.resolve_type("void").unwrap().is_void());
        assert!(desc.resolve_type("System.String").unwrap().is_primitive());
        assert!(desc.resolve_type("Nope").is_err());
    }

    #[test]
    fn test_self_referential_struct_rejected() {
        let desc = ModuleDescriptor::from_json(
            r#"{"structs":[{"name":"Node","fields":[{"name":"next","type":"Node"}]}]}"#,
        )
        .unwrap();
        let err = desc.resolve_type("Node").unwrap_err();
        assert!(err.contains("contains itself"));
    }

    #[test]
    fn test_malformed_descriptor() {
        assert!(ModuleDescriptor::from_json("{not json").is_err());
    }
}
