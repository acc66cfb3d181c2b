use crate::errors::AssignError;
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};

/// Outcome of one assignment, appended to the `ab` list of a tracked event.
///
/// `def` is kept for auditing only, the variant is never re-derived from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub name: String,
    pub variant: String,
    pub def: String,
}

/// Assignment records of a single tracked event, in assignment order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignments(Vec<AssignmentRecord>);

impl Assignments {
    pub fn push(&mut self, record: AssignmentRecord) {
        self.0.push(record);
    }
}

/// Compact JSON with every non-ASCII character written as a lowercase
/// `\uXXXX` escape (surrogate pairs outside the BMP).
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(fragment[start..i].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = i + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

/// Serializes a variant map as sorted-key JSON without whitespace.
pub(crate) fn canonical_def(weights: &BTreeMap<String, u64>) -> Result<String, AssignError> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, AsciiFormatter);
    weights.serialize(&mut serializer).map_err(serialize_error)?;

    String::from_utf8(buf).map_err(serialize_error)
}

fn serialize_error(e: impl fmt::Display) -> AssignError {
    AssignError::InvalidConfiguration(format!("could not serialize variants: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def_of(pairs: &[(&str, u64)]) -> String {
        let weights = pairs
            .iter()
            .map(|(name, weight)| (name.to_string(), *weight))
            .collect();
        canonical_def(&weights).unwrap()
    }

    #[test]
    fn test_canonical_def_sorted_and_compact() {
        assert_eq!(def_of(&[("b", 1), ("a", 2)]), r#"{"a":2,"b":1}"#);
        assert_eq!(def_of(&[("a", 2), ("b", 1)]), r#"{"a":2,"b":1}"#);
        assert_eq!(
            def_of(&[("treatment", 1), ("control", 3)]),
            r#"{"control":3,"treatment":1}"#
        );
    }

    #[test]
    fn test_canonical_def_escaping() {
        // Code point order puts "z" before "é".
        assert_eq!(def_of(&[("é", 1), ("z", 1)]), r#"{"z":1,"\u00e9":1}"#);
        assert_eq!(def_of(&[("🎉", 1)]), r#"{"\ud83c\udf89":1}"#);
        assert_eq!(def_of(&[("a\"b", 1)]), r#"{"a\"b":1}"#);
        assert_eq!(def_of(&[("tab\there", 1)]), r#"{"tab\there":1}"#);
        assert_eq!(def_of(&[("\u{1}", 1)]), r#"{"\u0001":1}"#);
        assert_eq!(def_of(&[("a/b", 1)]), r#"{"a/b":1}"#);
    }

    #[test]
    fn test_assignments_serialize_as_list() {
        let mut assignments = Assignments::default();
        assert_eq!(serde_json::to_string(&assignments).unwrap(), "[]");

        assignments.push(AssignmentRecord {
            name: "pricing".into(),
            variant: "a".into(),
            def: r#"{"a":2,"b":1}"#.into(),
        });

        let json = serde_json::to_string(&assignments).unwrap();
        assert_eq!(
            json,
            r#"[{"name":"pricing","variant":"a","def":"{\"a\":2,\"b\":1}"}]"#
        );
    }
}
