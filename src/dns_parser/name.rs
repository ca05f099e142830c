use std::collections::HashMap;
use std::mem;
use std::str::from_utf8;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::Error;

const POINTER_MASK: u16 = 0b1100_0000_0000_0000;

/// Largest buffer offset a compression pointer can express
pub const MAX_POINTER_OFFSET: usize = 0x3FFF;

const MAX_LABEL_LENGTH: usize = 63;
const MAX_NAME_LENGTH: usize = 255;

/// Lowercases a domain name for comparisons (RFC 1035 3.1, ASCII only)
pub fn dns_lower_case(name: &str) -> String {
    trim_root(name).to_ascii_lowercase()
}

/// Compares two domain names ignoring ASCII case and a trailing root dot
pub fn name_equals(a: &str, b: &str) -> bool {
    trim_root(a).eq_ignore_ascii_case(trim_root(b))
}

fn trim_root(name: &str) -> &str {
    match name.strip_suffix('.') {
        // an escaped dot belongs to the last label
        Some(rest) if (rest.len() - rest.trim_end_matches('\\').len()) % 2 == 0 => rest,
        _ => name,
    }
}

/// Escapes `.` and `\` so `label` stays one label inside a dotted name
pub fn escape_label(label: &str) -> String {
    let mut escaped = String::with_capacity(label.len());
    for c in label.chars() {
        if c == '.' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Splits a dotted name into unescaped labels
fn split_labels(name: &str) -> Vec<String> {
    let name = trim_root(name);
    let mut labels = Vec::new();
    if name.is_empty() {
        return labels;
    }

    let mut label = String::new();
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => label.extend(chars.next()),
            '.' => labels.push(mem::take(&mut label)),
            c => label.push(c),
        }
    }
    labels.push(label);
    labels
}

fn join_labels(labels: &[String]) -> String {
    labels
        .iter()
        .map(|label| escape_label(label))
        .collect::<Vec<_>>()
        .join(".")
}

fn suffix_key(labels: &[String]) -> String {
    join_labels(labels).to_ascii_lowercase()
}

#[derive(Debug, Clone)]
struct NamePlan {
    labels: Vec<String>,
    /// Leading labels written out literally
    literal: usize,
    /// (name index, label index) of an earlier literal occurrence of the
    /// remaining suffix
    pointer: Option<(usize, usize)>,
}

impl NamePlan {
    fn encoding_length(&self) -> usize {
        let labels: usize = self.labels[..self.literal]
            .iter()
            .map(|label| 1 + label.len())
            .sum();
        labels + if self.pointer.is_some() { 2 } else { 1 }
    }
}

/// Name compression state for exactly one packet
///
/// Encoding a packet with it runs in phases:
///
/// 1. every name is handed to [`track`](#method.track) in write order,
/// 2. [`compute_compression_paths`](#method.compute_compression_paths)
///    decides for each name which suffix is replaced by a pointer,
/// 3. [`next_name_length`](#method.next_name_length) replays the names to
///    compute the exact packet length,
/// 4. [`write_name`](#method.write_name) replays them once more to serialize.
///
/// Call [`rewind`](#method.rewind) before each replay. A coder must never be
/// reused for another packet.
#[derive(Debug)]
pub struct NameCoder {
    compress: bool,
    names: Vec<NamePlan>,
    computed: bool,
    offsets: Vec<Vec<usize>>,
    cursor: usize,
}

impl NameCoder {
    pub fn new() -> NameCoder {
        NameCoder {
            compress: true,
            names: Vec::new(),
            computed: false,
            offsets: Vec::new(),
            cursor: 0,
        }
    }

    /// A coder which never emits pointers, for legacy unicast responses
    pub fn without_compression() -> NameCoder {
        NameCoder {
            compress: false,
            ..NameCoder::new()
        }
    }

    pub fn is_compressing(&self) -> bool {
        self.compress
    }

    pub fn track(&mut self, name: &str) {
        assert!(!self.computed, "names must be tracked before computing paths");
        self.names.push(NamePlan {
            labels: split_labels(name),
            literal: 0,
            pointer: None,
        });
    }

    pub fn compute_compression_paths(&mut self) -> Result<(), Error> {
        let mut suffixes: HashMap<String, (usize, usize)> = HashMap::new();

        for (index, plan) in self.names.iter_mut().enumerate() {
            let mut uncompressed = 1;
            for label in &plan.labels {
                if label.is_empty() {
                    return Err(Error::UnknownLabelFormat);
                }
                if label.len() > MAX_LABEL_LENGTH {
                    return Err(Error::LabelTooLong);
                }
                uncompressed += 1 + label.len();
            }
            if uncompressed > MAX_NAME_LENGTH {
                return Err(Error::NameTooLong);
            }

            plan.literal = plan.labels.len();
            plan.pointer = None;

            if !self.compress {
                continue;
            }

            for label_index in 0..plan.labels.len() {
                let key = suffix_key(&plan.labels[label_index..]);
                if let Some(&target) = suffixes.get(&key) {
                    plan.literal = label_index;
                    plan.pointer = Some(target);
                    break;
                }
                suffixes.insert(key, (index, label_index));
            }
        }

        self.computed = true;
        self.rewind();
        Ok(())
    }

    /// Restarts the replay of tracked names
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.offsets.clear();
    }

    /// Exact encoded length of the next tracked name
    pub fn next_name_length(&mut self) -> usize {
        assert!(self.computed, "compression paths were not computed");
        let plan = &self.names[self.cursor];
        self.cursor += 1;
        plan.encoding_length()
    }

    /// Sum of all tracked names' encoded lengths
    pub fn total_names_length(&self) -> usize {
        assert!(self.computed, "compression paths were not computed");
        self.names.iter().map(NamePlan::encoding_length).sum()
    }

    /// Serializes the next tracked name at the end of `buf`
    ///
    /// `buf` must hold the packet from its first header byte, as pointers
    /// are absolute offsets into it. Returns the number of bytes written.
    pub fn write_name(&mut self, name: &str, buf: &mut Vec<u8>) -> Result<usize, Error> {
        assert!(self.computed, "compression paths were not computed");
        let plan = &self.names[self.cursor];
        debug_assert!(name_equals(name, &join_labels(&plan.labels)));

        let start = buf.len();
        let mut offsets = Vec::with_capacity(plan.literal);
        for label in &plan.labels[..plan.literal] {
            offsets.push(buf.len());
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }

        match plan.pointer {
            Some((name_index, label_index)) => {
                let offset = self.offsets[name_index][label_index];
                if offset > MAX_POINTER_OFFSET {
                    buf.truncate(start);
                    return Err(Error::PointerOutOfRange(offset));
                }
                buf.write_u16::<BigEndian>(offset as u16 | POINTER_MASK)
                    .expect("writing to a vec");
            }
            None => buf.push(0),
        }

        self.offsets.push(offsets);
        self.cursor += 1;
        Ok(buf.len() - start)
    }
}

impl Default for NameCoder {
    fn default() -> Self {
        NameCoder::new()
    }
}

/// Reads the name starting at `offset` of the packet `original`
///
/// Returns the dotted name (no trailing dot) and the number of bytes the
/// name occupies at `offset`. Every pointer has to point strictly before
/// the label sequence it was found in, which rules out forward, self
/// referencing and cyclic pointers.
pub fn read_name(original: &[u8], offset: usize) -> Result<(String, usize), Error> {
    let mut name = String::new();
    let mut pos = offset;
    let mut limit = offset;
    let mut consumed = None;
    let mut length = 1;

    loop {
        let byte = *original.get(pos).ok_or(Error::UnexpectedEOF)?;

        if byte == 0 {
            let consumed = consumed.unwrap_or_else(|| pos + 1 - offset);
            return Ok((name, consumed));
        } else if byte & 0b1100_0000 == 0b1100_0000 {
            if original.len() < pos + 2 {
                return Err(Error::UnexpectedEOF);
            }
            let pointer = (BigEndian::read_u16(&original[pos..pos + 2]) & !POINTER_MASK) as usize;
            if pointer >= limit {
                return Err(Error::InvalidPointer {
                    pointer,
                    position: pos,
                });
            }
            if consumed.is_none() {
                consumed = Some(pos + 2 - offset);
            }
            limit = pointer;
            pos = pointer;
        } else if byte & 0b1100_0000 == 0 {
            let end = pos + 1 + byte as usize;
            if end > original.len() {
                return Err(Error::UnexpectedEOF);
            }
            let label = from_utf8(&original[pos + 1..end]).map_err(|_| Error::LabelIsNotUtf8)?;
            length += 1 + label.len();
            if length > MAX_NAME_LENGTH {
                return Err(Error::NameTooLong);
            }
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&escape_label(label));
            pos = end;
        } else {
            return Err(Error::UnknownLabelFormat);
        }
    }
}
