use std::collections::HashMap;

use crate::error::{Error, Result};

/// Charset id of the `binary` pseudo-charset
pub const BINARY_CHARSET_ID: u16 = 63;

/// Text encodings the client can decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// ISO-8859-1, one byte per char
    Latin1,
    Utf8,
    Ascii,
    /// Not text. Values stay raw bytes.
    Binary,
}

impl Encoding {
    /// Decode server bytes into a `String`.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 | Encoding::Binary => simdutf8::basic::from_utf8(bytes)
                .map(ToString::to_string)
                .map_err(|_| Error::Charset("invalid utf-8 sequence".to_string())),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            Encoding::Ascii => {
                if bytes.is_ascii() {
                    Ok(bytes.iter().map(|&b| b as char).collect())
                } else {
                    Err(Error::Charset("non-ascii byte in ascii column".to_string()))
                }
            }
        }
    }

    /// Encode a client string for the wire. Characters the encoding cannot
    /// represent are replaced by `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 | Encoding::Binary => text.as_bytes().to_vec(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charset {
    pub id: u16,
    pub name: String,
    pub encoding: Encoding,
}

/// Maps server charset ids and names to encodings.
///
/// Starts with the charsets the server ships by default and can be extended
/// with [`CharsetRegistry::register`].
#[derive(Debug, Clone)]
pub struct CharsetRegistry {
    by_id: HashMap<u16, Charset>,
    by_name: HashMap<String, Encoding>,
}

const BUILTIN: &[(u16, &str, Encoding)] = &[
    (5, "latin1", Encoding::Latin1),
    (8, "latin1", Encoding::Latin1),
    (11, "ascii", Encoding::Ascii),
    (15, "latin1", Encoding::Latin1),
    (31, "latin1", Encoding::Latin1),
    (33, "utf8", Encoding::Utf8),
    (45, "utf8mb4", Encoding::Utf8),
    (46, "utf8mb4", Encoding::Utf8),
    (47, "latin1", Encoding::Latin1),
    (48, "latin1", Encoding::Latin1),
    (49, "latin1", Encoding::Latin1),
    (63, "binary", Encoding::Binary),
    (65, "ascii", Encoding::Ascii),
    (83, "utf8", Encoding::Utf8),
    (192, "utf8", Encoding::Utf8),
    (224, "utf8mb4", Encoding::Utf8),
    (255, "utf8mb4", Encoding::Utf8),
];

impl Default for CharsetRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        };
        for &(id, name, encoding) in BUILTIN {
            registry.insert(id, name, encoding);
        }
        registry.by_name.insert("utf8mb3".to_string(), Encoding::Utf8);
        registry.by_name.insert("cp1252".to_string(), Encoding::Latin1);
        registry
    }
}

impl CharsetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, id: u16, name: &str, encoding: Encoding) {
        let name = name.to_ascii_lowercase();
        self.by_name.insert(name.clone(), encoding);
        self.by_id.insert(id, Charset { id, name, encoding });
    }

    /// Register a charset id under a name the registry already knows.
    pub fn register(&mut self, id: u16, name: &str) -> Result<()> {
        let encoding = self
            .encoding_for_name(name)
            .ok_or_else(|| Error::Charset(format!("unknown charset name '{name}'")))?;
        self.insert(id, name, encoding);
        Ok(())
    }

    /// Register a new charset name together with its encoding.
    pub fn register_encoding(&mut self, id: u16, name: &str, encoding: Encoding) {
        self.insert(id, name, encoding);
    }

    pub fn get(&self, id: u16) -> Option<&Charset> {
        self.by_id.get(&id)
    }

    pub fn encoding_for_name(&self, name: &str) -> Option<Encoding> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// Encoding for a column charset id, falling back to `default` for unknown ids.
    pub fn encoding_for_id(&self, id: u16, default: Encoding) -> Encoding {
        self.by_id.get(&id).map_or(default, |charset| charset.encoding)
    }
}
