use crate::core::tokenizer::{TokenType, Vocabulary};
use crate::core::TokenId;
use crate::infra::Result;
use anyhow::{bail, Context};
use std::io::{Read, Write};

const GGUF_MAGIC: u32 = 0x46554747;
const MAX_STRING_BYTES: usize = 10_000_000;
const MAX_ARRAY_LEN: usize = 1 << 24;
const MAX_KV_COUNT: u64 = 1 << 16;

const TYPE_UINT8: u32 = 0;
const TYPE_INT8: u32 = 1;
const TYPE_UINT16: u32 = 2;
const TYPE_INT16: u32 = 3;
const TYPE_UINT32: u32 = 4;
const TYPE_INT32: u32 = 5;
const TYPE_FLOAT32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_UINT64: u32 = 10;
const TYPE_INT64: u32 = 11;
const TYPE_FLOAT64: u32 = 12;

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    /// Element type id plus the elements, so empty arrays keep their type.
    Array(u32, Vec<MetadataValue>),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl MetadataValue {
    pub fn type_id(&self) -> u32 {
        match self {
            MetadataValue::Uint8(_) => TYPE_UINT8,
            MetadataValue::Int8(_) => TYPE_INT8,
            MetadataValue::Uint16(_) => TYPE_UINT16,
            MetadataValue::Int16(_) => TYPE_INT16,
            MetadataValue::Uint32(_) => TYPE_UINT32,
            MetadataValue::Int32(_) => TYPE_INT32,
            MetadataValue::Float32(_) => TYPE_FLOAT32,
            MetadataValue::Bool(_) => TYPE_BOOL,
            MetadataValue::String(_) => TYPE_STRING,
            MetadataValue::Array(..) => TYPE_ARRAY,
            MetadataValue::Uint64(_) => TYPE_UINT64,
            MetadataValue::Int64(_) => TYPE_INT64,
            MetadataValue::Float64(_) => TYPE_FLOAT64,
        }
    }

    pub fn strings(items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        MetadataValue::Array(
            TYPE_STRING,
            items.into_iter().map(|s| MetadataValue::String(s.into())).collect(),
        )
    }

    pub fn floats(items: impl IntoIterator<Item = f32>) -> Self {
        MetadataValue::Array(TYPE_FLOAT32, items.into_iter().map(MetadataValue::Float32).collect())
    }

    pub fn ints(items: impl IntoIterator<Item = i32>) -> Self {
        MetadataValue::Array(TYPE_INT32, items.into_iter().map(MetadataValue::Int32).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            MetadataValue::Uint8(v) => Some(v as i64),
            MetadataValue::Int8(v) => Some(v as i64),
            MetadataValue::Uint16(v) => Some(v as i64),
            MetadataValue::Int16(v) => Some(v as i64),
            MetadataValue::Uint32(v) => Some(v as i64),
            MetadataValue::Int32(v) => Some(v as i64),
            MetadataValue::Uint64(v) => i64::try_from(v).ok(),
            MetadataValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            MetadataValue::Float32(v) => Some(v),
            MetadataValue::Float64(v) => Some(v as f32),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            MetadataValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::Array(_, items) => Some(items),
            _ => None,
        }
    }
}

/// Header and key/value section of a GGUF file. Tensor infos and data are
/// never read.
#[derive(Debug, Clone, PartialEq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    /// Key/values in file order.
    pub kv: Vec<(String, MetadataValue)>,
}

impl GgufMetadata {
    pub fn new() -> Self {
        Self {
            version: 3,
            tensor_count: 0,
            kv: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.kv.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        let key = key.into();
        match self.kv.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.kv.push((key, value)),
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(MetadataValue::as_i64)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(MetadataValue::as_bool)
    }

    pub fn architecture(&self) -> Option<&str> {
        self.string("general.architecture")
    }

    fn array(&self, key: &str) -> Option<&[MetadataValue]> {
        self.get(key).and_then(MetadataValue::as_array)
    }

    fn token_id(&self, key: &str) -> Option<TokenId> {
        self.int(key)
            .and_then(|v| i32::try_from(v).ok())
            .map(TokenId)
    }

    /// Extracts the `tokenizer.ggml.*` keys.
    pub fn to_vocabulary(&self) -> Result<Vocabulary> {
        let model = self
            .string("tokenizer.ggml.model")
            .context("missing tokenizer.ggml.model")?;

        let tokens: Vec<String> = self
            .array("tokenizer.ggml.tokens")
            .context("missing tokenizer.ggml.tokens")?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<_>>()
            .context("tokenizer.ggml.tokens is not a string array")?;
        if tokens.is_empty() {
            bail!("tokenizer.ggml.tokens is empty");
        }

        let mut vocab = Vocabulary::new(model, tokens);
        let size = vocab.size();
        vocab.pre = self.string("tokenizer.ggml.pre").map(str::to_string);

        if let Some(scores) = self.array("tokenizer.ggml.scores") {
            for (slot, value) in vocab.scores.iter_mut().zip(scores) {
                *slot = value.as_f32().unwrap_or(0.0);
            }
        }

        if let Some(types) = self.array("tokenizer.ggml.token_type") {
            for (slot, value) in vocab.types.iter_mut().zip(types) {
                *slot = value.as_i64().map(TokenType::from).unwrap_or(TokenType::Normal);
            }
        }

        if let Some(merges) = self.array("tokenizer.ggml.merges") {
            vocab.merges = merges
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }

        let in_range = |id: &TokenId| id.index().is_some_and(|i| i < size);
        if let Some(id) = self.token_id("tokenizer.ggml.bos_token_id").filter(in_range) {
            vocab.bos_token = id;
        }
        if let Some(id) = self.token_id("tokenizer.ggml.eos_token_id").filter(in_range) {
            vocab.eos_token = id;
        }
        vocab.unk_token = self
            .token_id("tokenizer.ggml.unknown_token_id")
            .filter(in_range)
            .or_else(|| {
                vocab
                    .types
                    .iter()
                    .position(|t| *t == TokenType::Unknown)
                    .map(|i| TokenId(i as i32))
            });
        if let Some(add_space_prefix) = self.bool("tokenizer.ggml.add_space_prefix") {
            vocab.add_space_prefix = add_space_prefix;
        }

        Ok(vocab)
    }

    /// Writes a GGUF file holding this metadata and no tensors.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&GGUF_MAGIC.to_le_bytes())?;
        writer.write_all(&3u32.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;
        writer.write_all(&(self.kv.len() as u64).to_le_bytes())?;

        for (key, value) in &self.kv {
            write_string(writer, key)?;
            writer.write_all(&value.type_id().to_le_bytes())?;
            write_value(writer, value)?;
        }

        writer.flush()?;
        Ok(())
    }
}

impl Default for GgufMetadata {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GgufReader;

impl GgufReader {
    /// Reads the header and metadata from any byte stream, leaving the
    /// stream positioned at the first tensor info.
    pub fn read_metadata<R: Read>(reader: &mut R) -> Result<GgufMetadata> {
        let magic = read_u32(reader).context("reading GGUF magic")?;
        if magic != GGUF_MAGIC {
            bail!("Invalid GGUF magic: expected 0x{:08X}, got 0x{:08X}", GGUF_MAGIC, magic);
        }

        let version = read_u32(reader)?;
        if !(2..=3).contains(&version) {
            bail!("Unsupported GGUF version: {}", version);
        }

        let tensor_count = read_u64(reader)?;
        let kv_count = read_u64(reader)?;
        if kv_count > MAX_KV_COUNT {
            bail!("Too many metadata entries: {}", kv_count);
        }

        let mut kv = Vec::with_capacity(kv_count as usize);
        for _ in 0..kv_count {
            let key = read_string(reader)?;
            let value_type = read_u32(reader)?;
            let value = read_value(reader, value_type)
                .with_context(|| format!("reading metadata value for {}", key))?;
            kv.push((key, value));
        }

        Ok(GgufMetadata {
            version,
            tensor_count,
            kv,
        })
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u64(reader)? as usize;
    if len > MAX_STRING_BYTES {
        bail!("String too large: {} bytes", len);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_value<R: Read>(reader: &mut R, value_type: u32) -> Result<MetadataValue> {
    Ok(match value_type {
        TYPE_UINT8 => MetadataValue::Uint8(u8::from_le_bytes(read_array(reader)?)),
        TYPE_INT8 => MetadataValue::Int8(i8::from_le_bytes(read_array(reader)?)),
        TYPE_UINT16 => MetadataValue::Uint16(u16::from_le_bytes(read_array(reader)?)),
        TYPE_INT16 => MetadataValue::Int16(i16::from_le_bytes(read_array(reader)?)),
        TYPE_UINT32 => MetadataValue::Uint32(read_u32(reader)?),
        TYPE_INT32 => MetadataValue::Int32(i32::from_le_bytes(read_array(reader)?)),
        TYPE_FLOAT32 => MetadataValue::Float32(f32::from_le_bytes(read_array(reader)?)),
        TYPE_BOOL => MetadataValue::Bool(read_array::<_, 1>(reader)?[0] != 0),
        TYPE_STRING => MetadataValue::String(read_string(reader)?),
        TYPE_ARRAY => {
            let element_type = read_u32(reader)?;
            let len = read_u64(reader)? as usize;
            if len > MAX_ARRAY_LEN {
                bail!("Array too large: {} elements", len);
            }
            let mut items = Vec::with_capacity(len.min(1 << 16));
            for _ in 0..len {
                items.push(read_value(reader, element_type)?);
            }
            MetadataValue::Array(element_type, items)
        }
        TYPE_UINT64 => MetadataValue::Uint64(read_u64(reader)?),
        TYPE_INT64 => MetadataValue::Int64(i64::from_le_bytes(read_array(reader)?)),
        TYPE_FLOAT64 => MetadataValue::Float64(f64::from_le_bytes(read_array(reader)?)),
        _ => bail!("Unknown value type: {}", value_type),
    })
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_all(&(s.len() as u64).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn write_value<W: Write>(writer: &mut W, value: &MetadataValue) -> Result<()> {
    match value {
        MetadataValue::Uint8(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Int8(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Uint16(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Int16(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Uint32(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Int32(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Float32(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Bool(v) => writer.write_all(&[u8::from(*v)])?,
        MetadataValue::String(s) => write_string(writer, s)?,
        MetadataValue::Array(element_type, items) => {
            writer.write_all(&element_type.to_le_bytes())?;
            writer.write_all(&(items.len() as u64).to_le_bytes())?;
            for item in items {
                if item.type_id() != *element_type {
                    bail!("Mixed array element types: {} in array of {}", item.type_id(), element_type);
                }
                write_value(writer, item)?;
            }
        }
        MetadataValue::Uint64(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Int64(v) => writer.write_all(&v.to_le_bytes())?,
        MetadataValue::Float64(v) => writer.write_all(&v.to_le_bytes())?,
    }
    Ok(())
}
