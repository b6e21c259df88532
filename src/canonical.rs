//! Canonical digesting of structured payloads, used by the approval
//! engine so every signer hashes exactly the same bytes for a given
//! logical request (spec §4.3: "fixed ordering, lexicographic by field
//! name, little-endian integer widths").
//!
//! Adapted from the teacher's `canonicalize.rs`, which normalizes free
//! text (null-byte stripping, NFC unicode normalization) to defeat
//! semantic-gap attacks on action strings. That normalization still runs
//! on every string field here, underneath the lexicographic/LE-integer
//! canonicalization this module adds on top.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use unicode_normalization::UnicodeNormalization;

fn normalize_str(raw: &str) -> String {
    raw.replace('\0', "").nfc().collect::<String>().trim().to_string()
}

/// One field's value in a canonical payload. `BTreeMap` already orders
/// keys lexicographically, which is the field-ordering rule; this enum
/// fixes the byte-width rule for the value itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalValue {
    Str(String),
    I64(i64),
    U64(u64),
    Bool(bool),
    Bytes(Vec<u8>),
}

/// A structured payload to be canonically digested and signed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalPayload {
    fields: BTreeMap<String, CanonicalValue>,
}

impl CanonicalPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_str(mut self, field: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.fields
            .insert(field.into(), CanonicalValue::Str(normalize_str(value.as_ref())));
        self
    }

    pub fn with_i64(mut self, field: impl Into<String>, value: i64) -> Self {
        self.fields.insert(field.into(), CanonicalValue::I64(value));
        self
    }

    pub fn with_u64(mut self, field: impl Into<String>, value: u64) -> Self {
        self.fields.insert(field.into(), CanonicalValue::U64(value));
        self
    }

    pub fn with_bool(mut self, field: impl Into<String>, value: bool) -> Self {
        self.fields.insert(field.into(), CanonicalValue::Bool(value));
        self
    }

    pub fn with_bytes(mut self, field: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields
            .insert(field.into(), CanonicalValue::Bytes(value.into()));
        self
    }

    /// Serialize to the fixed canonical byte form: fields in
    /// lexicographic key order, each entry as
    /// `[key_len: u32 LE][key bytes][tag: u8][value bytes (LE-width ints)]`.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.fields {
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            match value {
                CanonicalValue::Str(s) => {
                    out.push(0u8);
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                CanonicalValue::I64(v) => {
                    out.push(1u8);
                    out.extend_from_slice(&v.to_le_bytes());
                }
                CanonicalValue::U64(v) => {
                    out.push(2u8);
                    out.extend_from_slice(&v.to_le_bytes());
                }
                CanonicalValue::Bool(b) => {
                    out.push(3u8);
                    out.push(if *b { 1 } else { 0 });
                }
                CanonicalValue::Bytes(b) => {
                    out.push(4u8);
                    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
        out
    }

    /// SHA-256 of the canonical byte form. This is the hash every signer
    /// in a multi-signature approval signs over.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_bytes());
        hasher.finalize().into()
    }
}
