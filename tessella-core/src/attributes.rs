// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `attributes` module holds codestream parameter attributes in memory.
//!
//! Attributes are keyed by name and hold one or more records of typed fields. A
//! marked-records counter distinguishes values written for the current codestream from
//! stale values left over from a previous one, which matters when the parameter system
//! is re-used across a `restart`: `clear_marks` forgets nothing but makes everything
//! unreadable, and `remove_unmarked` then discards whatever was not re-set.

use std::fmt;

/// A single typed attribute field value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i32),
    Float(f32),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
        }
    }
}

struct Attribute {
    name: String,
    /// One character per field: 'I' for integer, 'F' for float.
    pattern: String,
    /// `records[r][f]` is field `f` of record `r`; unset fields are `None`.
    records: Vec<Vec<Option<AttrValue>>>,
    /// Records set since the last `clear_marks`; only these are readable.
    num_marked: usize,
}

impl Attribute {
    fn ensure_record(&mut self, record: usize) {
        let fields = self.pattern.len();
        while self.records.len() <= record {
            self.records.push(vec![None; fields]);
        }
    }
}

/// An in-memory store of named parameter attributes.
#[derive(Default)]
pub struct AttributeStore {
    attrs: Vec<Attribute>,
}

impl AttributeStore {
    pub fn new() -> Self {
        AttributeStore { attrs: Vec::new() }
    }

    /// Defines an attribute with the given field pattern ('I' and 'F' characters).
    /// Defining an existing name is a no-op.
    pub fn define(&mut self, name: &str, pattern: &str) {
        debug_assert!(pattern.chars().all(|c| c == 'I' || c == 'F'));
        if self.find(name).is_none() {
            self.attrs.push(Attribute {
                name: name.to_string(),
                pattern: pattern.to_string(),
                records: Vec::new(),
                num_marked: 0,
            });
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.name == name)
    }

    /// Sets field `field` of record `record`, marking the record as current. Returns
    /// false if the attribute is undefined or the field's type does not match the
    /// pattern.
    pub fn set(&mut self, name: &str, record: usize, field: usize, value: AttrValue) -> bool {
        let Some(idx) = self.find(name) else { return false };
        let attr = &mut self.attrs[idx];
        let expect = attr.pattern.as_bytes().get(field).copied();
        let ok = match (expect, &value) {
            (Some(b'I'), AttrValue::Int(_)) => true,
            (Some(b'F'), AttrValue::Float(_)) => true,
            _ => false,
        };
        if !ok {
            return false;
        }
        attr.ensure_record(record);
        attr.records[record][field] = Some(value);
        if attr.num_marked <= record {
            attr.num_marked = record + 1;
        }
        true
    }

    pub fn set_int(&mut self, name: &str, record: usize, field: usize, value: i32) -> bool {
        self.set(name, record, field, AttrValue::Int(value))
    }

    pub fn set_float(&mut self, name: &str, record: usize, field: usize, value: f32) -> bool {
        self.set(name, record, field, AttrValue::Float(value))
    }

    /// Reads field `field` of record `record`. Records beyond the marked count are
    /// invisible, even if they still hold values from a previous codestream.
    pub fn get(&self, name: &str, record: usize, field: usize) -> Option<AttrValue> {
        let attr = &self.attrs[self.find(name)?];
        if record >= attr.num_marked {
            return None;
        }
        attr.records.get(record)?.get(field).copied().flatten()
    }

    pub fn get_int(&self, name: &str, record: usize, field: usize) -> Option<i32> {
        match self.get(name, record, field) {
            Some(AttrValue::Int(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str, record: usize, field: usize) -> Option<f32> {
        match self.get(name, record, field) {
            Some(AttrValue::Float(v)) => Some(v),
            _ => None,
        }
    }

    /// Renders an attribute's marked records as `Name={f1,f2},{f1,f2}`, the form used
    /// for diagnostics and parameter echoes. Unset fields print as `-`.
    pub fn describe(&self, name: &str) -> Option<String> {
        let attr = &self.attrs[self.find(name)?];
        let mut out = String::from(name);
        out.push('=');
        for (r, record) in attr.records.iter().enumerate().take(attr.num_marked) {
            if r > 0 {
                out.push(',');
            }
            out.push('{');
            for (f, field) in record.iter().enumerate() {
                if f > 0 {
                    out.push(',');
                }
                match field {
                    Some(v) => out.push_str(&v.to_string()),
                    None => out.push('-'),
                }
            }
            out.push('}');
        }
        Some(out)
    }

    /// Resets the marked-record counters so that subsequent reads see nothing until new
    /// values are set. Called when parameter translation restarts for a new codestream.
    pub fn clear_marks(&mut self) {
        for attr in &mut self.attrs {
            attr.num_marked = 0;
        }
    }

    /// Discards records that were not re-marked since the last `clear_marks`. Returns
    /// true if anything was discarded.
    pub fn remove_unmarked(&mut self) -> bool {
        let mut removed = false;
        for attr in &mut self.attrs {
            if attr.records.len() > attr.num_marked {
                attr.records.truncate(attr.num_marked);
                removed = true;
            }
        }
        removed
    }
}
