use std::fmt;

use crate::dockv::{hex_dump, value_type};
use crate::errors::{ResolverError, Result};

/// One component of a doc key or sub key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyComponent {
    Int64(i64),
    String(Vec<u8>),
}

impl KeyComponent {
    /// Appends the order-preserving encoding of this component to `out`.
    pub fn append_encoded(&self, out: &mut Vec<u8>) {
        match self {
            KeyComponent::Int64(value) => {
                out.push(value_type::INT64);
                out.extend_from_slice(&((*value as u64) ^ (1 << 63)).to_be_bytes());
            }
            KeyComponent::String(bytes) => {
                out.push(value_type::STRING);
                for &byte in bytes {
                    if byte == 0 {
                        out.extend_from_slice(&[0x00, 0x01]);
                    } else {
                        out.push(byte);
                    }
                }
                out.extend_from_slice(&[0x00, 0x00]);
            }
        }
    }
}

impl From<i64> for KeyComponent {
    fn from(value: i64) -> Self {
        KeyComponent::Int64(value)
    }
}

impl From<&str> for KeyComponent {
    fn from(value: &str) -> Self {
        KeyComponent::String(value.as_bytes().to_vec())
    }
}

impl From<String> for KeyComponent {
    fn from(value: String) -> Self {
        KeyComponent::String(value.into_bytes())
    }
}

impl fmt::Display for KeyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyComponent::Int64(value) => write!(f, "{}", value),
            KeyComponent::String(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
        }
    }
}

/// Path of a document or sub-document: the doc key components followed by
/// the sub key components leading to the touched value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DocPath {
    pub doc_key: Vec<KeyComponent>,
    pub subkeys: Vec<KeyComponent>,
}

impl DocPath {
    pub fn new<I, C>(doc_key: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<KeyComponent>,
    {
        Self {
            doc_key: doc_key.into_iter().map(Into::into).collect(),
            subkeys: Vec::new(),
        }
    }

    pub fn with_subkey(mut self, subkey: impl Into<KeyComponent>) -> Self {
        self.subkeys.push(subkey.into());
        self
    }

    /// Encodes the path. The encoded doc key, terminated by a group end, is a
    /// byte prefix of the encoding of every path below it.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for component in &self.doc_key {
            component.append_encoded(&mut out);
        }
        out.push(value_type::GROUP_END);
        for component in &self.subkeys {
            component.append_encoded(&mut out);
        }
        out
    }

    /// Decodes a complete encoded path.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let mut path = DocPath::default();
        let mut pos = 0;
        let mut in_doc_key = true;
        while pos < encoded.len() {
            if in_doc_key && encoded[pos] == value_type::GROUP_END {
                in_doc_key = false;
                pos += 1;
                continue;
            }
            let (component, end) = decode_component(encoded, pos)?;
            if in_doc_key {
                path.doc_key.push(component);
            } else {
                path.subkeys.push(component);
            }
            pos = end;
        }
        if in_doc_key {
            return Err(ResolverError::Corruption(format!(
                "Doc key is not terminated: {}",
                hex_dump(encoded)
            )));
        }
        Ok(path)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DocPath([")?;
        write_components(f, &self.doc_key)?;
        f.write_str("], [")?;
        write_components(f, &self.subkeys)?;
        f.write_str("])")
    }
}

fn write_components(f: &mut fmt::Formatter<'_>, components: &[KeyComponent]) -> fmt::Result {
    for (idx, component) in components.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", component)?;
    }
    Ok(())
}

/// Component boundaries of an encoded, possibly partial, path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathBoundaries {
    /// End offset of every doc key component.
    pub doc_key_component_ends: Vec<usize>,
    /// Offset just past the group end, if the doc key is complete.
    pub doc_key_end: Option<usize>,
    /// End offset of every sub key component.
    pub subkey_ends: Vec<usize>,
}

/// Finds component boundaries without materializing component values.
pub fn decode_boundaries(encoded: &[u8]) -> Result<PathBoundaries> {
    let mut result = PathBoundaries::default();
    let mut pos = 0;
    while pos < encoded.len() {
        if result.doc_key_end.is_none() && encoded[pos] == value_type::GROUP_END {
            pos += 1;
            result.doc_key_end = Some(pos);
            continue;
        }
        pos = skip_component(encoded, pos)?;
        if result.doc_key_end.is_none() {
            result.doc_key_component_ends.push(pos);
        } else {
            result.subkey_ends.push(pos);
        }
    }
    Ok(result)
}

/// Human readable form of an encoded path, including partial doc keys.
pub(crate) fn describe_path(encoded: &[u8]) -> Result<String> {
    let mut doc_key = Vec::new();
    let mut subkeys = Vec::new();
    let mut complete = false;
    let mut pos = 0;
    while pos < encoded.len() {
        if !complete && encoded[pos] == value_type::GROUP_END {
            complete = true;
            pos += 1;
            continue;
        }
        let (component, end) = decode_component(encoded, pos)?;
        if complete {
            subkeys.push(component);
        } else {
            doc_key.push(component);
        }
        pos = end;
    }
    if complete {
        Ok(DocPath { doc_key, subkeys }.to_string())
    } else {
        let rendered: Vec<String> = doc_key.iter().map(ToString::to_string).collect();
        Ok(format!("PartialDocKey([{}])", rendered.join(", ")))
    }
}

fn skip_component(encoded: &[u8], pos: usize) -> Result<usize> {
    match encoded[pos] {
        value_type::INT64 => {
            let end = pos + 9;
            if end > encoded.len() {
                return Err(truncated(encoded, pos));
            }
            Ok(end)
        }
        value_type::STRING => {
            let mut idx = pos + 1;
            loop {
                match encoded.get(idx) {
                    None => return Err(truncated(encoded, pos)),
                    Some(0x00) => match encoded.get(idx + 1) {
                        Some(0x00) => return Ok(idx + 2),
                        Some(0x01) => idx += 2,
                        _ => return Err(truncated(encoded, pos)),
                    },
                    Some(_) => idx += 1,
                }
            }
        }
        other => Err(ResolverError::Corruption(format!(
            "Unexpected value type {:#04x} at offset {} in {}",
            other,
            pos,
            hex_dump(encoded)
        ))),
    }
}

fn decode_component(encoded: &[u8], pos: usize) -> Result<(KeyComponent, usize)> {
    let end = skip_component(encoded, pos)?;
    let component = match encoded[pos] {
        value_type::INT64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&encoded[pos + 1..end]);
            KeyComponent::Int64((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
        }
        _ => {
            // Body sits between the marker and the 0x00 0x00 terminator.
            let body = &encoded[pos + 1..end - 2];
            let mut bytes = Vec::with_capacity(body.len());
            let mut idx = 0;
            while idx < body.len() {
                bytes.push(body[idx]);
                idx += if body[idx] == 0 { 2 } else { 1 };
            }
            KeyComponent::String(bytes)
        }
    };
    Ok((component, end))
}

fn truncated(encoded: &[u8], pos: usize) -> ResolverError {
    ResolverError::Corruption(format!(
        "Truncated key component at offset {} in {}",
        pos,
        hex_dump(encoded)
    ))
}
