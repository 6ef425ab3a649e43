//! Save actions: field formatters applied to an entry before it is persisted.
//!
//! The serialized form lives in the metadata under `saveActions`:
//!
//! ```text
//! enabled;
//! title[trim_whitespace,normalize_whitespace]
//! journal[remove_enclosing_braces]
//! ```

use crate::entry::{BibEntry, normalize_field_name};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A field value transformation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldFormatter {
    Identity,
    TrimWhitespace,
    /// Collapse every run of whitespace to one space and trim.
    NormalizeWhitespace,
    LowerCase,
    UpperCase,
    /// `{Value}` becomes `Value`; unbalanced outer braces are left alone.
    RemoveEnclosingBraces,
}

impl FieldFormatter {
    pub const ALL: [FieldFormatter; 6] = [
        Self::Identity,
        Self::TrimWhitespace,
        Self::NormalizeWhitespace,
        Self::LowerCase,
        Self::UpperCase,
        Self::RemoveEnclosingBraces,
    ];

    /// Key used in the serialized save actions.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::TrimWhitespace => "trim_whitespace",
            Self::NormalizeWhitespace => "normalize_whitespace",
            Self::LowerCase => "lower_case",
            Self::UpperCase => "upper_case",
            Self::RemoveEnclosingBraces => "remove_enclosing_braces",
        }
    }

    pub fn format(&self, value: &str) -> String {
        match self {
            Self::Identity => value.to_string(),
            Self::TrimWhitespace => value.trim().to_string(),
            Self::NormalizeWhitespace => value.split_whitespace().collect::<Vec<_>>().join(" "),
            Self::LowerCase => value.to_lowercase(),
            Self::UpperCase => value.to_uppercase(),
            Self::RemoveEnclosingBraces => remove_enclosing_braces(value),
        }
    }
}

impl FromStr for FieldFormatter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|formatter| formatter.key() == s)
            .ok_or_else(|| Error::UnknownFormatter(s.to_string()))
    }
}

fn remove_enclosing_braces(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return value.to_string();
    };

    // The opening brace must be closed by the final one, not earlier.
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return value.to_string();
                }
            }
            _ => {}
        }
    }
    if depth == 0 {
        inner.to_string()
    } else {
        value.to_string()
    }
}

/// One formatter bound to one field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldFormatterCleanup {
    pub field: String,
    pub formatter: FieldFormatter,
}

/// A field value rewritten by the save actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// The configured save actions of a database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldFormatterCleanups {
    enabled: bool,
    actions: Vec<FieldFormatterCleanup>,
}

impl FieldFormatterCleanups {
    pub fn new(enabled: bool, actions: Vec<FieldFormatterCleanup>) -> Self {
        Self { enabled, actions }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn actions(&self) -> &[FieldFormatterCleanup] {
        &self.actions
    }

    /// Parse the serialized form stored in the metadata.
    pub fn parse(serialized: &str) -> Result<Self> {
        let (flag, mut remaining) = serialized.split_once(';').ok_or_else(|| {
            Error::MalformedSaveActions("missing enabled/disabled prefix".to_string())
        })?;
        let enabled = match flag.trim() {
            "enabled" => true,
            "disabled" => false,
            other => {
                return Err(Error::MalformedSaveActions(format!(
                    "expected 'enabled' or 'disabled', got '{other}'"
                )));
            }
        };

        let mut actions = Vec::new();
        remaining = remaining.trim();
        while !remaining.is_empty() {
            let open = remaining.find('[').ok_or_else(|| {
                Error::MalformedSaveActions(format!("missing '[' in '{remaining}'"))
            })?;
            let close = remaining[open..]
                .find(']')
                .map(|offset| open + offset)
                .ok_or_else(|| {
                    Error::MalformedSaveActions(format!("missing ']' in '{remaining}'"))
                })?;

            let field = normalize_field_name(&remaining[..open]);
            if field.is_empty() {
                return Err(Error::MalformedSaveActions(
                    "formatter list without field name".to_string(),
                ));
            }
            for key in remaining[open + 1..close].split(',') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                actions.push(FieldFormatterCleanup {
                    field: field.clone(),
                    formatter: key.parse()?,
                });
            }
            remaining = remaining[close + 1..].trim_start();
        }

        Ok(Self { enabled, actions })
    }

    /// Compute the field changes these save actions would make to an entry.
    ///
    /// Formatters on the same field are chained in declaration order.
    pub fn changes_for(&self, entry: &BibEntry) -> Vec<FieldChange> {
        if !self.enabled {
            return Vec::new();
        }

        let mut formatted: BTreeMap<&str, String> = BTreeMap::new();
        for action in &self.actions {
            let current = match formatted.get(action.field.as_str()) {
                Some(value) => value.as_str(),
                None => match entry.field(&action.field) {
                    Some(value) => value,
                    None => continue,
                },
            };
            let next = action.formatter.format(current);
            formatted.insert(action.field.as_str(), next);
        }

        formatted
            .into_iter()
            .filter_map(|(field, new_value)| {
                let old_value = entry.field(field)?;
                (old_value != new_value).then(|| FieldChange {
                    field: field.to_string(),
                    old_value: old_value.to_string(),
                    new_value,
                })
            })
            .collect()
    }
}

impl fmt::Display for FieldFormatterCleanups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};", if self.enabled { "enabled" } else { "disabled" })?;
        let mut index = 0;
        while index < self.actions.len() {
            let field = &self.actions[index].field;
            let keys: Vec<&str> = self.actions[index..]
                .iter()
                .take_while(|action| &action.field == field)
                .map(|action| action.formatter.key())
                .collect();
            write!(f, "\n{}[{}]", field, keys.join(","))?;
            index += keys.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatters() {
        assert_eq!(FieldFormatter::TrimWhitespace.format("  a b  "), "a b");
        assert_eq!(
            FieldFormatter::NormalizeWhitespace.format(" a \n\t b "),
            "a b"
        );
        assert_eq!(FieldFormatter::LowerCase.format("RuSt"), "rust");
        assert_eq!(FieldFormatter::UpperCase.format("RuSt"), "RUST");
        assert_eq!(FieldFormatter::Identity.format(" x "), " x ");
    }

    #[test]
    fn test_remove_enclosing_braces() {
        let formatter = FieldFormatter::RemoveEnclosingBraces;
        assert_eq!(formatter.format("{Rust}"), "Rust");
        assert_eq!(formatter.format("{A} and {B}"), "{A} and {B}");
        assert_eq!(formatter.format("{{Nested}}"), "{Nested}");
        assert_eq!(formatter.format("plain"), "plain");
    }

    #[test]
    fn test_parse_and_display() {
        let cleanups = FieldFormatterCleanups::parse(
            "enabled;\nTitle[trim_whitespace, lower_case]\njournal[remove_enclosing_braces]",
        )
        .unwrap();
        assert!(cleanups.is_enabled());
        assert_eq!(cleanups.actions().len(), 3);
        assert_eq!(cleanups.actions()[0].field, "title");

        let serialized = cleanups.to_string();
        assert_eq!(
            serialized,
            "enabled;\ntitle[trim_whitespace,lower_case]\njournal[remove_enclosing_braces]"
        );
        assert_eq!(FieldFormatterCleanups::parse(&serialized).unwrap(), cleanups);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            FieldFormatterCleanups::parse("title[lower_case]"),
            Err(Error::MalformedSaveActions(_))
        ));
        assert!(matches!(
            FieldFormatterCleanups::parse("maybe;title[lower_case]"),
            Err(Error::MalformedSaveActions(_))
        ));
        assert!(matches!(
            FieldFormatterCleanups::parse("enabled;title[lower_case"),
            Err(Error::MalformedSaveActions(_))
        ));
        assert!(matches!(
            FieldFormatterCleanups::parse("enabled;title[shout]"),
            Err(Error::UnknownFormatter(_))
        ));
    }

    #[test]
    fn test_changes_for_chains_formatters() {
        let cleanups =
            FieldFormatterCleanups::parse("enabled;title[trim_whitespace,upper_case] year[trim_whitespace]")
                .unwrap();
        let entry = BibEntry::new("article")
            .with_field("title", "  rust ")
            .with_field("year", "2024");

        let changes = cleanups.changes_for(&entry);
        assert_eq!(
            changes,
            vec![FieldChange {
                field: "title".to_string(),
                old_value: "  rust ".to_string(),
                new_value: "RUST".to_string(),
            }]
        );
    }

    #[test]
    fn test_disabled_cleanups_change_nothing() {
        let cleanups = FieldFormatterCleanups::parse("disabled;title[upper_case]").unwrap();
        let entry = BibEntry::new("article").with_field("title", "rust");
        assert!(cleanups.changes_for(&entry).is_empty());
    }
}
