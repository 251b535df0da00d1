use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::debug;

use crate::error::PipelineError;

/// Field map as read off the page. Anything may be missing or blank.
pub type RawRecord = HashMap<String, Option<String>>;

const KEY_FIELD_SEP: char = '\u{1f}';
const KEY_PAIR_SEP: char = '\u{1e}';

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Substituted when the raw value is absent or blank. `None` keeps the
    /// field null.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl FieldSpec {
    pub fn new(name: &str, fallback: Option<&str>) -> Self {
        FieldSpec {
            name: name.to_string(),
            fallback: fallback.map(str::to_string),
        }
    }
}

/// A validated record. Field order follows the schema it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Option<String>)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn values(&self) -> impl Iterator<Item = Option<&str>> {
        self.fields.iter().map(|(_, v)| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Field list plus the subset of fields that identifies a record.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    fields: Vec<FieldSpec>,
    // Sorted, so the key does not depend on how the subset was written down.
    identity: Vec<String>,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldSpec>, identity: &[String]) -> Result<Self, PipelineError> {
        if fields.is_empty() {
            return Err(PipelineError::Schema("no fields".into()));
        }
        let mut names = HashSet::new();
        for f in &fields {
            if f.name.trim().is_empty() {
                return Err(PipelineError::Schema("blank field name".into()));
            }
            if !names.insert(f.name.as_str()) {
                return Err(PipelineError::Schema(format!("field '{}' listed twice", f.name)));
            }
        }
        if identity.is_empty() {
            return Err(PipelineError::Schema("identity key needs at least one field".into()));
        }
        if let Some(unknown) = identity.iter().find(|k| !names.contains(k.as_str())) {
            return Err(PipelineError::Schema(format!(
                "identity field '{}' is not a schema field",
                unknown
            )));
        }

        let mut identity: Vec<String> = identity.to_vec();
        identity.sort();
        identity.dedup();
        Ok(RecordSchema { fields, identity })
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Normalize a raw field map into a record. Never fails: blank or
    /// missing values take the field's fallback.
    pub fn validate(&self, raw: &RawRecord) -> Record {
        let fields = self
            .fields
            .iter()
            .map(|spec| {
                let value = raw
                    .get(&spec.name)
                    .and_then(|v| v.as_deref())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
                let value = match value {
                    Some(v) => Some(v),
                    None => {
                        debug!("Field '{}' missing, using fallback {:?}", spec.name, spec.fallback);
                        spec.fallback.clone()
                    }
                };
                (spec.name.clone(), value)
            })
            .collect();
        Record { fields }
    }

    /// Deterministic identity key over the identity fields.
    ///
    /// Every value is length-prefixed (`v<bytes>:`) and null is a bare `n`,
    /// so the key decodes back to exactly one tuple whatever the values
    /// contain, separators included.
    pub fn identity_key(&self, record: &Record) -> String {
        let mut key = String::new();
        for name in &self.identity {
            key.push_str(name);
            key.push(KEY_FIELD_SEP);
            match record.get(name) {
                Some(v) => {
                    key.push('v');
                    key.push_str(&v.len().to_string());
                    key.push(':');
                    key.push_str(v);
                }
                None => key.push('n'),
            }
            key.push(KEY_PAIR_SEP);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.to_string())))
            .collect()
    }

    fn answers() -> RecordSchema {
        RecordSchema::new(
            vec![
                FieldSpec::new("title", Some("No title")),
                FieldSpec::new("answer", Some("No answer")),
                FieldSpec::new("author", None),
            ],
            &["title".to_string(), "answer".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn trims_and_keeps_values() {
        let rec = answers().validate(&raw(&[("title", "  Q1 \n"), ("answer", "yes")]));
        assert_eq!(rec.get("title"), Some("Q1"));
        assert_eq!(rec.get("answer"), Some("yes"));
        assert_eq!(rec.get("author"), None);
        assert_eq!(rec.len(), 3);
    }

    #[test]
    fn blank_fields_take_fallbacks() {
        let mut r = raw(&[("title", ""), ("answer", "   ")]);
        r.insert("author".into(), None);
        let rec = answers().validate(&r);
        assert_eq!(rec.get("title"), Some("No title"));
        assert_eq!(rec.get("answer"), Some("No answer"));
        assert_eq!(rec.get("author"), None);
    }

    #[test]
    fn unknown_raw_fields_are_ignored() {
        let rec = answers().validate(&raw(&[("title", "t"), ("junk", "x")]));
        let names: Vec<_> = rec.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["title", "answer", "author"]);
    }

    #[test]
    fn identity_ignores_non_key_fields() {
        let s = answers();
        let a = s.validate(&raw(&[("title", "A"), ("answer", "x"), ("author", "bob")]));
        let b = s.validate(&raw(&[("title", "A"), ("answer", "x"), ("author", "eve")]));
        assert_eq!(s.identity_key(&a), s.identity_key(&b));
    }

    #[test]
    fn identity_is_order_independent() {
        let fields = answers().fields.clone();
        let s1 = RecordSchema::new(fields.clone(), &["title".into(), "answer".into()]).unwrap();
        let s2 = RecordSchema::new(fields, &["answer".into(), "title".into()]).unwrap();
        let rec = s1.validate(&raw(&[("title", "A"), ("answer", "x")]));
        assert_eq!(s1.identity_key(&rec), s2.identity_key(&rec));
    }

    #[test]
    fn identity_has_no_concatenation_collisions() {
        let s = answers();
        let a = s.validate(&raw(&[("title", "ab"), ("answer", "c")]));
        let b = s.validate(&raw(&[("title", "a"), ("answer", "bc")]));
        assert_ne!(s.identity_key(&a), s.identity_key(&b));
    }

    #[test]
    fn separators_inside_values_cannot_forge_a_key() {
        let s = answers();
        let a = s.validate(&raw(&[("title", "r"), ("answer", "p\u{1e}title\u{1f}q")]));
        let b = s.validate(&raw(&[("title", "q\u{1e}title\u{1f}r"), ("answer", "p")]));
        assert_ne!(s.identity_key(&a), s.identity_key(&b));

        let c = s.validate(&raw(&[("title", "x\u{1e}"), ("answer", "y")]));
        let d = s.validate(&raw(&[("title", "x"), ("answer", "\u{1e}y")]));
        assert_ne!(s.identity_key(&c), s.identity_key(&d));
    }

    #[test]
    fn null_and_lookalike_values_differ() {
        let fields = answers().fields.clone();
        let s = RecordSchema::new(fields, &["title".into(), "author".into()]).unwrap();
        let missing = s.validate(&raw(&[("title", "A")]));
        for lookalike in ["\u{0}", "n", "v0:"] {
            let present = s.validate(&raw(&[("title", "A"), ("author", lookalike)]));
            assert_ne!(s.identity_key(&missing), s.identity_key(&present), "{:?}", lookalike);
        }
    }

    #[test]
    fn rejects_bad_identity() {
        let fields = vec![FieldSpec::new("title", None)];
        assert!(RecordSchema::new(fields.clone(), &[]).is_err());
        assert!(RecordSchema::new(fields, &["body".into()]).is_err());
    }
}
