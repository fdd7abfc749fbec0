// QuillDB
// Copyright (C) 2025 QuillDB contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Binary serialization module
// Type-tagged little-endian encoding of primitives, containers, timestamps
// and documents, shared by the WAL and the page payloads. Every value starts
// with a one-byte tag so the reader can detect a mismatch instead of
// misinterpreting bytes.

use std::collections::BTreeMap;
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::document::value::Value;
use crate::document::Document;
use crate::storage_engine::lib::{StorageError, StorageResult};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_OBJECT: u8 = 7;
const TAG_U64: u8 = 8;
const TAG_TIMESTAMP: u8 = 9;
const TAG_DOCUMENT: u8 = 10;

/// A point in time carried as ticks (milliseconds since the Unix epoch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

/// Values that can be serialized into the tagged binary form
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Values that can be deserialized from the tagged binary form
pub trait Decode: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self>;

    fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let mut reader = bytes;
        Self::decode_from(&mut reader)
    }
}

fn expect_tag<R: Read>(reader: &mut R, expected: u8) -> StorageResult<()> {
    let tag = reader.read_u8()?;
    if tag != expected {
        return Err(StorageError::CorruptRecord(format!("expected tag {expected}, found {tag}")));
    }
    Ok(())
}

fn read_len<R: Read>(reader: &mut R) -> StorageResult<usize> {
    Ok(reader.read_u32::<LittleEndian>()? as usize)
}

impl Encode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_BOOL);
        out.push(*self as u8);
    }
}

impl Decode for bool {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_BOOL)?;
        Ok(reader.read_u8()? != 0)
    }
}

impl Encode for i64 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_I64);
        out.write_i64::<LittleEndian>(*self).expect("writing to a Vec cannot fail");
    }
}

impl Decode for i64 {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_I64)?;
        Ok(reader.read_i64::<LittleEndian>()?)
    }
}

impl Encode for u64 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_U64);
        out.write_u64::<LittleEndian>(*self).expect("writing to a Vec cannot fail");
    }
}

impl Decode for u64 {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_U64)?;
        Ok(reader.read_u64::<LittleEndian>()?)
    }
}

impl Encode for f64 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_F64);
        out.write_f64::<LittleEndian>(*self).expect("writing to a Vec cannot fail");
    }
}

impl Decode for f64 {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_F64)?;
        Ok(reader.read_f64::<LittleEndian>()?)
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_STR);
        out.write_u32::<LittleEndian>(self.len() as u32).expect("writing to a Vec cannot fail");
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decode for String {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_STR)?;
        let len = read_len(reader)?;
        let mut buffer = vec![0u8; len];
        reader.read_exact(&mut buffer)?;
        String::from_utf8(buffer).map_err(|e| StorageError::CorruptRecord(format!("invalid UTF-8 string: {e}")))
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_BYTES);
        out.write_u32::<LittleEndian>(self.len() as u32).expect("writing to a Vec cannot fail");
        out.extend_from_slice(self);
    }
}

impl Decode for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_BYTES)?;
        let len = read_len(reader)?;
        let mut buffer = vec![0u8; len];
        reader.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

impl Encode for Timestamp {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_TIMESTAMP);
        out.write_i64::<LittleEndian>(self.0).expect("writing to a Vec cannot fail");
    }
}

impl Decode for Timestamp {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_TIMESTAMP)?;
        Ok(Timestamp(reader.read_i64::<LittleEndian>()?))
    }
}

impl Encode for Value {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(TAG_NULL),
            Value::Bool(b) => b.encode(out),
            Value::I64(i) => i.encode(out),
            Value::F64(f) => f.encode(out),
            Value::Str(s) => s.encode(out),
            Value::Bytes(b) => b.encode(out),
            Value::Array(items) => {
                out.push(TAG_ARRAY);
                out.write_u32::<LittleEndian>(items.len() as u32).expect("writing to a Vec cannot fail");
                for item in items {
                    item.encode(out);
                }
            }
            Value::Object(fields) => {
                out.push(TAG_OBJECT);
                out.write_u32::<LittleEndian>(fields.len() as u32).expect("writing to a Vec cannot fail");
                for (name, value) in fields {
                    name.encode(out);
                    value.encode(out);
                }
            }
        }
    }
}

impl Decode for Value {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        let tag = reader.read_u8()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => Ok(Value::Bool(reader.read_u8()? != 0)),
            TAG_I64 => Ok(Value::I64(reader.read_i64::<LittleEndian>()?)),
            TAG_F64 => Ok(Value::F64(reader.read_f64::<LittleEndian>()?)),
            TAG_STR => {
                let len = read_len(reader)?;
                let mut buffer = vec![0u8; len];
                reader.read_exact(&mut buffer)?;
                let s = String::from_utf8(buffer).map_err(|e| StorageError::CorruptRecord(format!("invalid UTF-8 string: {e}")))?;
                Ok(Value::Str(s))
            }
            TAG_BYTES => {
                let len = read_len(reader)?;
                let mut buffer = vec![0u8; len];
                reader.read_exact(&mut buffer)?;
                Ok(Value::Bytes(buffer))
            }
            TAG_ARRAY => {
                let len = read_len(reader)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Value::decode_from(reader)?);
                }
                Ok(Value::Array(items))
            }
            TAG_OBJECT => {
                let len = read_len(reader)?;
                let mut fields = BTreeMap::new();
                for _ in 0..len {
                    let name = String::decode_from(reader)?;
                    let value = Value::decode_from(reader)?;
                    fields.insert(name, value);
                }
                Ok(Value::Object(fields))
            }
            other => Err(StorageError::CorruptRecord(format!("unknown value tag {other}"))),
        }
    }
}

impl Encode for Document {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_DOCUMENT);
        self.id.encode(out);
        self.version.encode(out);
        Timestamp(self.created_at as i64).encode(out);
        Timestamp(self.updated_at as i64).encode(out);
        Value::Object(self.fields.clone()).encode(out);
    }
}

impl Decode for Document {
    fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        expect_tag(reader, TAG_DOCUMENT)?;
        let id = String::decode_from(reader)?;
        let version = u64::decode_from(reader)?;
        let created_at = Timestamp::decode_from(reader)?.0 as u64;
        let updated_at = Timestamp::decode_from(reader)?.0 as u64;
        let fields = match Value::decode_from(reader)? {
            Value::Object(fields) => fields,
            other => {
                return Err(StorageError::CorruptRecord(format!("document fields must be an object, found {other:?}")));
            }
        };

        Ok(Document {
            id,
            version,
            created_at,
            updated_at,
            fields,
        })
    }
}

/// Encode a collection entry as stored in a data page: the entry key
/// (`<collection>/<id>`) followed by the document, so a page is
/// self-describing.
pub fn encode_entry(key: &str, document: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    key.to_string().encode(&mut out);
    document.encode(&mut out);
    out
}

/// Decode a collection entry from a data page payload
pub fn decode_entry(bytes: &[u8]) -> StorageResult<(String, Document)> {
    let mut reader = bytes;
    let key = String::decode_from(&mut reader)?;
    let document = Document::decode_from(&mut reader)?;
    Ok((key, document))
}
