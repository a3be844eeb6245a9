//! Runtime protobuf decoding.
//!
//! Parses `.proto` schema files at runtime (no codegen) into a
//! [`DescriptorRegistry`], then decodes binary payloads against a resolved
//! descriptor and re-marshals them as canonical JSON text. Resolution failure
//! is not an error: the decode pipeline treats an absent descriptor as "leave
//! the bytes alone".

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use protobuf::CodedInputStream;
use protobuf_parse::Parser;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Scalar and composite field kinds the decoder understands.
#[derive(Debug, Clone, PartialEq)]
enum FieldKind {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
    /// Nested message, by type name
    Message(String),
    Enum,
}

impl FieldKind {
    /// Numeric scalars may arrive packed (wire type 2) under proto3.
    fn is_packable(&self) -> bool {
        !matches!(self, FieldKind::String | FieldKind::Bytes | FieldKind::Message(_))
    }
}

#[derive(Debug, Clone)]
struct FieldDescriptor {
    name: String,
    kind: FieldKind,
    repeated: bool,
}

/// Describes one message type from a parsed schema.
#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    /// Fully qualified name, e.g. "mypackage.MyMessage"
    pub name: String,
    /// Fields indexed by wire tag number
    fields: HashMap<i32, FieldDescriptor>,
}

/// Registry of message descriptors parsed from `.proto` sources.
#[derive(Debug, Clone, Default)]
pub struct DescriptorRegistry {
    messages: HashMap<String, MessageDescriptor>,
}

impl DescriptorRegistry {
    /// Parse a `.proto` file, resolving imports relative to its directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let mut parser = Parser::new();
        parser.input(p);
        if let Some(parent) = p.parent() {
            parser.include(parent);
        }
        let parsed = parser
            .parse_and_typecheck()
            .map_err(|e| Error::Decode(format!("Failed to parse proto schema: {e}")))?;

        let mut messages = HashMap::new();
        for file_descriptor in parsed.file_descriptors {
            for message in &file_descriptor.message_type {
                let simple_name = message.name.clone().unwrap_or_default();
                if simple_name.is_empty() {
                    continue;
                }
                let full_name = match &file_descriptor.package {
                    Some(package) if !package.is_empty() => format!("{package}.{simple_name}"),
                    _ => simple_name.clone(),
                };

                let mut fields = HashMap::new();
                for field in &message.field {
                    let Some(name) = field.name.clone() else {
                        continue;
                    };
                    let number = field.number.unwrap_or(0);
                    let repeated = field.label
                        == Some(
                            protobuf::descriptor::field_descriptor_proto::Label::LABEL_REPEATED
                                .into(),
                        );
                    fields.insert(
                        number,
                        FieldDescriptor {
                            name,
                            kind: field_kind(field)?,
                            repeated,
                        },
                    );
                }

                messages.insert(
                    simple_name,
                    MessageDescriptor {
                        name: full_name,
                        fields,
                    },
                );
            }
        }

        Ok(Self { messages })
    }

    /// Parse schema text by way of a temp file (protobuf-parse wants paths).
    pub fn from_string(content: &str) -> Result<Self> {
        use std::io::Write;
        let mut temp_file = tempfile::Builder::new()
            .suffix(".proto")
            .tempfile()
            .map_err(|e| Error::Decode(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| Error::Decode(format!("Failed to write temp file: {e}")))?;
        Self::from_file(temp_file.path())
    }

    /// Look up a descriptor by simple type name. Absence is not an error.
    pub fn resolve(&self, type_name: &str) -> Option<&MessageDescriptor> {
        self.messages.get(type_name)
    }

    /// Decode binary protobuf into canonical JSON text.
    pub fn decode_to_json(&self, type_name: &str, data: &[u8]) -> Result<String> {
        let descriptor = self
            .resolve(type_name)
            .ok_or_else(|| Error::Decode(format!("Unknown message type: {type_name}")))?;
        let mut stream = CodedInputStream::from_bytes(data);
        let value = self.decode_message(descriptor, &mut stream)?;
        serde_json::to_string(&value).map_err(|e| Error::Decode(e.to_string()))
    }

    fn decode_message(
        &self,
        descriptor: &MessageDescriptor,
        stream: &mut CodedInputStream,
    ) -> Result<Value> {
        let mut fields: Map<String, Value> = Map::new();

        while !stream.eof().map_err(decode_err)? {
            let tag = stream.read_raw_varint32().map_err(decode_err)?;
            if tag == 0 {
                break;
            }
            let field_number = (tag >> 3) as i32;
            let wire_type = tag & 0x7;

            let field = descriptor.fields.get(&field_number).ok_or_else(|| {
                Error::Decode(format!(
                    "Unknown field number {} in message {}",
                    field_number, descriptor.name
                ))
            })?;

            if field.repeated {
                let entry = fields
                    .entry(field.name.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(values) = entry else {
                    unreachable!("repeated field entries are arrays");
                };
                if wire_type == 2 && field.kind.is_packable() {
                    // Packed encoding: a length-delimited run of scalars.
                    let len = stream.read_raw_varint32().map_err(decode_err)?;
                    let old_limit = stream.push_limit(len as u64).map_err(decode_err)?;
                    while !stream.eof().map_err(decode_err)? {
                        values.push(self.decode_scalar(&field.kind, stream)?);
                    }
                    stream.pop_limit(old_limit);
                } else {
                    values.push(self.decode_scalar(&field.kind, stream)?);
                }
            } else {
                let value = self.decode_scalar(&field.kind, stream)?;
                fields.insert(field.name.clone(), value);
            }
        }

        Ok(Value::Object(fields))
    }

    fn decode_scalar(&self, kind: &FieldKind, stream: &mut CodedInputStream) -> Result<Value> {
        let value = match kind {
            FieldKind::Double => json_f64(stream.read_double().map_err(decode_err)?),
            FieldKind::Float => json_f64(stream.read_float().map_err(decode_err)? as f64),
            FieldKind::Int32 => Value::from(stream.read_int32().map_err(decode_err)?),
            FieldKind::Int64 => Value::from(stream.read_int64().map_err(decode_err)?),
            FieldKind::Uint32 => Value::from(stream.read_uint32().map_err(decode_err)?),
            FieldKind::Uint64 => Value::from(stream.read_uint64().map_err(decode_err)?),
            FieldKind::Sint32 => Value::from(stream.read_sint32().map_err(decode_err)?),
            FieldKind::Sint64 => Value::from(stream.read_sint64().map_err(decode_err)?),
            FieldKind::Fixed32 => Value::from(stream.read_fixed32().map_err(decode_err)?),
            FieldKind::Fixed64 => Value::from(stream.read_fixed64().map_err(decode_err)?),
            FieldKind::Sfixed32 => Value::from(stream.read_sfixed32().map_err(decode_err)?),
            FieldKind::Sfixed64 => Value::from(stream.read_sfixed64().map_err(decode_err)?),
            FieldKind::Bool => Value::Bool(stream.read_bool().map_err(decode_err)?),
            FieldKind::String => Value::String(stream.read_string().map_err(decode_err)?),
            FieldKind::Bytes => {
                Value::String(STANDARD.encode(stream.read_bytes().map_err(decode_err)?))
            }
            FieldKind::Enum => Value::from(stream.read_int32().map_err(decode_err)?),
            FieldKind::Message(type_name) => {
                let len = stream.read_raw_varint32().map_err(decode_err)?;
                let old_limit = stream.push_limit(len as u64).map_err(decode_err)?;
                // The descriptor carries the fully qualified name; registry
                // keys are simple names.
                let simple = type_name.split('.').next_back().unwrap_or(type_name);
                let nested = self
                    .resolve(simple)
                    .ok_or_else(|| Error::Decode(format!("Unknown message type: {simple}")))?
                    .clone();
                let value = self.decode_message(&nested, stream)?;
                stream.pop_limit(old_limit);
                value
            }
        };
        Ok(value)
    }
}

fn field_kind(field: &protobuf::descriptor::FieldDescriptorProto) -> Result<FieldKind> {
    use protobuf::descriptor::field_descriptor_proto::Type;

    let type_enum = field
        .type_
        .ok_or_else(|| Error::Decode("Field missing type".to_string()))?
        .enum_value_or_default();

    Ok(match type_enum {
        Type::TYPE_DOUBLE => FieldKind::Double,
        Type::TYPE_FLOAT => FieldKind::Float,
        Type::TYPE_INT32 => FieldKind::Int32,
        Type::TYPE_INT64 => FieldKind::Int64,
        Type::TYPE_UINT32 => FieldKind::Uint32,
        Type::TYPE_UINT64 => FieldKind::Uint64,
        Type::TYPE_SINT32 => FieldKind::Sint32,
        Type::TYPE_SINT64 => FieldKind::Sint64,
        Type::TYPE_FIXED32 => FieldKind::Fixed32,
        Type::TYPE_FIXED64 => FieldKind::Fixed64,
        Type::TYPE_SFIXED32 => FieldKind::Sfixed32,
        Type::TYPE_SFIXED64 => FieldKind::Sfixed64,
        Type::TYPE_BOOL => FieldKind::Bool,
        Type::TYPE_STRING => FieldKind::String,
        Type::TYPE_BYTES => FieldKind::Bytes,
        Type::TYPE_ENUM => FieldKind::Enum,
        Type::TYPE_MESSAGE => {
            FieldKind::Message(field.type_name.clone().unwrap_or_default())
        }
        Type::TYPE_GROUP => {
            return Err(Error::Decode(
                "TYPE_GROUP is proto2-only and not supported".to_string(),
            ))
        }
    })
}

fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn decode_err(e: protobuf::Error) -> Error {
    Error::Decode(e.to_string())
}
