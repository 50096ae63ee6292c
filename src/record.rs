//! The canonical output record and its field vocabulary.
//!
//! Replies from the extraction service use whatever key spelling the model
//! felt like that day ("Paper No.", "paper_no", "Paper_No"). [`canonical_field`]
//! folds every spelling onto one [`Field`], so the rest of the pipeline works
//! with a fixed struct instead of string-keyed maps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Sentinel stored for any field the reply did not fill.
pub const NO_DATA: &str = "No data";

/// One named field of a [`SessionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    SessionName,
    SessionCode,
    Overview,
    PaperNo,
    Title,
    MainAuthorGroup,
    MainAuthorAffiliation,
    CoAuthorGroup,
    CoAuthorAffiliation,
    Organizers,
    Chairperson,
}

impl Field {
    /// Every field in output order.
    pub const ALL: [Field; 11] = [
        Field::SessionName,
        Field::SessionCode,
        Field::Overview,
        Field::PaperNo,
        Field::Title,
        Field::MainAuthorGroup,
        Field::MainAuthorAffiliation,
        Field::CoAuthorGroup,
        Field::CoAuthorAffiliation,
        Field::Organizers,
        Field::Chairperson,
    ];

    /// Canonical snake_case key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::SessionName => "session_name",
            Field::SessionCode => "session_code",
            Field::Overview => "overview",
            Field::PaperNo => "paper_no",
            Field::Title => "title",
            Field::MainAuthorGroup => "main_author_group",
            Field::MainAuthorAffiliation => "main_author_affiliation",
            Field::CoAuthorGroup => "co_author_group",
            Field::CoAuthorAffiliation => "co_author_affiliation",
            Field::Organizers => "organizers",
            Field::Chairperson => "chairperson",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folded spelling → canonical field. Keys are already lowercase with every
/// run of non-alphanumerics collapsed to `_`.
const ALIASES: &[(&str, Field)] = &[
    ("session_name", Field::SessionName),
    ("session_title", Field::SessionName),
    ("session", Field::SessionName),
    ("session_code", Field::SessionCode),
    ("code", Field::SessionCode),
    ("session_id", Field::SessionCode),
    ("overview", Field::Overview),
    ("abstract", Field::Overview),
    ("session_overview", Field::Overview),
    ("description", Field::Overview),
    ("paper_no", Field::PaperNo),
    ("paper_number", Field::PaperNo),
    ("paper", Field::PaperNo),
    ("paperno", Field::PaperNo),
    ("title", Field::Title),
    ("paper_title", Field::Title),
    ("main_author_group", Field::MainAuthorGroup),
    ("main_author_gr", Field::MainAuthorGroup),
    ("main_author", Field::MainAuthorGroup),
    ("main_authors", Field::MainAuthorGroup),
    ("authors", Field::MainAuthorGroup),
    ("main_author_affiliation", Field::MainAuthorAffiliation),
    ("affiliation", Field::MainAuthorAffiliation),
    ("affiliations", Field::MainAuthorAffiliation),
    ("co_author_group", Field::CoAuthorGroup),
    ("co_author_gr", Field::CoAuthorGroup),
    ("co_author_affiliation_gr", Field::CoAuthorGroup),
    ("co_authors", Field::CoAuthorGroup),
    ("coauthor_group", Field::CoAuthorGroup),
    ("co_author_affiliation", Field::CoAuthorAffiliation),
    ("coauthor_affiliation", Field::CoAuthorAffiliation),
    ("organizers", Field::Organizers),
    ("organizer", Field::Organizers),
    ("organisers", Field::Organizers),
    ("chairperson", Field::Chairperson),
    ("chairpersons", Field::Chairperson),
    ("chair_person", Field::Chairperson),
    ("chair", Field::Chairperson),
];

/// Lowercase a key and collapse every run of non-alphanumerics into `_`.
///
/// `"Paper No."` → `"paper_no"`, `"Co-author & Affiliation GR"` →
/// `"co_author_affiliation_gr"`.
pub fn fold_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut pending_sep = false;
    for c in key.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Map any key spelling onto its canonical field, case-insensitively.
pub fn canonical_field(key: &str) -> Option<Field> {
    let folded = fold_key(key);
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == folded)
        .map(|(_, field)| *field)
}

/// `true` when a value carries no information (empty or the sentinel).
pub fn is_blank(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.eq_ignore_ascii_case(NO_DATA)
}

/// One technical-session row: a session, optionally narrowed to one paper.
///
/// Every field is a plain string; missing values hold [`NO_DATA`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_name: String,
    pub session_code: String,
    pub overview: String,
    pub paper_no: String,
    pub title: String,
    pub main_author_group: String,
    pub main_author_affiliation: String,
    pub co_author_group: String,
    pub co_author_affiliation: String,
    pub organizers: String,
    pub chairperson: String,
    /// Identifier of the originating document.
    pub source: String,
}

impl Default for SessionRecord {
    fn default() -> Self {
        let no = || NO_DATA.to_string();
        Self {
            session_name: no(),
            session_code: no(),
            overview: no(),
            paper_no: no(),
            title: no(),
            main_author_group: no(),
            main_author_affiliation: no(),
            co_author_group: no(),
            co_author_affiliation: no(),
            organizers: no(),
            chairperson: no(),
            source: String::new(),
        }
    }
}

/// Why a reply object was not turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRejection {
    /// The array element is not an object.
    NotAnObject,
    /// A required field is absent.
    MissingField(Field),
    /// A known field holds a number, bool, null, array or object.
    NonStringValue(Field),
}

impl fmt::Display for RecordRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRejection::NotAnObject => f.write_str("element is not an object"),
            RecordRejection::MissingField(field) => write!(f, "missing required field {field}"),
            RecordRejection::NonStringValue(field) => write!(f, "non-string value for {field}"),
        }
    }
}

impl SessionRecord {
    /// Borrow a field by name.
    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::SessionName => &self.session_name,
            Field::SessionCode => &self.session_code,
            Field::Overview => &self.overview,
            Field::PaperNo => &self.paper_no,
            Field::Title => &self.title,
            Field::MainAuthorGroup => &self.main_author_group,
            Field::MainAuthorAffiliation => &self.main_author_affiliation,
            Field::CoAuthorGroup => &self.co_author_group,
            Field::CoAuthorAffiliation => &self.co_author_affiliation,
            Field::Organizers => &self.organizers,
            Field::Chairperson => &self.chairperson,
        }
    }

    /// Overwrite a field. Blank values are stored as [`NO_DATA`].
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value: String = value.into();
        let value = if is_blank(&value) {
            NO_DATA.to_string()
        } else {
            value.trim().to_string()
        };
        let slot = match field {
            Field::SessionName => &mut self.session_name,
            Field::SessionCode => &mut self.session_code,
            Field::Overview => &mut self.overview,
            Field::PaperNo => &mut self.paper_no,
            Field::Title => &mut self.title,
            Field::MainAuthorGroup => &mut self.main_author_group,
            Field::MainAuthorAffiliation => &mut self.main_author_affiliation,
            Field::CoAuthorGroup => &mut self.co_author_group,
            Field::CoAuthorAffiliation => &mut self.co_author_affiliation,
            Field::Organizers => &mut self.organizers,
            Field::Chairperson => &mut self.chairperson,
        };
        *slot = value;
    }

    /// `true` when the field holds no information.
    pub fn is_missing(&self, field: Field) -> bool {
        is_blank(self.get(field))
    }

    /// Build a record from one reply object.
    ///
    /// Keys are folded through the alias table; unknown keys are ignored.
    /// A non-string value for a known field, or an absent required field,
    /// rejects the whole object. Nothing is coerced.
    pub fn from_json(value: &Value, required: &[Field]) -> Result<Self, RecordRejection> {
        let object = value.as_object().ok_or(RecordRejection::NotAnObject)?;
        Self::from_object(object, required)
    }

    fn from_object(object: &Map<String, Value>, required: &[Field]) -> Result<Self, RecordRejection> {
        let mut record = SessionRecord::default();
        let mut seen: Vec<Field> = Vec::with_capacity(object.len());
        for (key, value) in object {
            let Some(field) = canonical_field(key) else {
                continue;
            };
            let Value::String(text) = value else {
                return Err(RecordRejection::NonStringValue(field));
            };
            // First spelling wins when a reply repeats a field under two aliases.
            if seen.contains(&field) {
                continue;
            }
            seen.push(field);
            record.set(field, text.as_str());
        }
        if let Some(missing) = required.iter().find(|f| !seen.contains(f)) {
            return Err(RecordRejection::MissingField(*missing));
        }
        Ok(record)
    }

    /// Flat `(key, value)` pairs in output order, `source` last.
    pub fn to_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs: Vec<(&'static str, &str)> =
            Field::ALL.iter().map(|f| (f.as_str(), self.get(*f))).collect();
        pairs.push(("source", self.source.as_str()));
        pairs
    }

    /// Composite key used for deduplication.
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::of(self)
    }
}

/// `(session_code, paper_no)` with blanks normalised to `""`.
///
/// Records without an identifying paper number carry their title as a
/// tiebreaker so two panel entries, or two `ORAL ONLY` talks, of one session
/// are not collapsed into one. A paper number identifies a paper only when
/// it holds a digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub session_code: String,
    pub paper_no: String,
    tiebreak: Option<String>,
}

impl IdentityKey {
    fn of(record: &SessionRecord) -> Self {
        let norm = |v: &str| {
            if is_blank(v) {
                String::new()
            } else {
                v.trim().to_string()
            }
        };
        let session_code = norm(&record.session_code);
        let paper_no = norm(&record.paper_no);
        let tiebreak = if !paper_no.chars().any(|c| c.is_ascii_digit()) {
            Some(norm(&record.title).to_lowercase())
        } else {
            None
        };
        Self {
            session_code,
            paper_no,
            tiebreak,
        }
    }

    /// `("", "")`: a session-only entry that is never deduplicated.
    pub fn is_sentinel(&self) -> bool {
        self.session_code.is_empty() && self.paper_no.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fold_key_variants() {
        assert_eq!(fold_key("Paper No."), "paper_no");
        assert_eq!(fold_key("Paper_No"), "paper_no");
        assert_eq!(fold_key("  paper no "), "paper_no");
        assert_eq!(fold_key("Co-author & Affiliation GR"), "co_author_affiliation_gr");
    }

    #[test]
    fn canonical_field_is_case_insensitive() {
        assert_eq!(canonical_field("PAPER NO"), Some(Field::PaperNo));
        assert_eq!(canonical_field("Session_Code"), Some(Field::SessionCode));
        assert_eq!(canonical_field("Abstract"), Some(Field::Overview));
        assert_eq!(canonical_field("Main-author GR"), Some(Field::MainAuthorGroup));
        assert_eq!(canonical_field("Source File"), None);
    }

    #[test]
    fn from_json_fills_sentinel() {
        let v = json!({"Session Code": "ABC123", "Title": "Panel"});
        let r = SessionRecord::from_json(&v, &[Field::SessionCode]).unwrap();
        assert_eq!(r.session_code, "ABC123");
        assert_eq!(r.paper_no, NO_DATA);
        assert_eq!(r.chairperson, NO_DATA);
    }

    #[test]
    fn from_json_blank_becomes_sentinel() {
        let v = json!({"session_code": "  ", "title": ""});
        let r = SessionRecord::from_json(&v, &[]).unwrap();
        assert_eq!(r.session_code, NO_DATA);
        assert_eq!(r.title, NO_DATA);
    }

    #[test]
    fn from_json_rejects_missing_required() {
        let v = json!({"title": "T"});
        assert_eq!(
            SessionRecord::from_json(&v, &[Field::SessionCode]),
            Err(RecordRejection::MissingField(Field::SessionCode))
        );
    }

    #[test]
    fn from_json_rejects_non_string() {
        let v = json!({"session_code": "X", "paper_no": 12});
        assert_eq!(
            SessionRecord::from_json(&v, &[]),
            Err(RecordRejection::NonStringValue(Field::PaperNo))
        );
        let v = json!({"session_code": null});
        assert!(SessionRecord::from_json(&v, &[]).is_err());
    }

    #[test]
    fn from_json_ignores_unknown_non_string() {
        let v = json!({"session_code": "X", "confidence": 0.9});
        assert!(SessionRecord::from_json(&v, &[Field::SessionCode]).is_ok());
    }

    #[test]
    fn identity_sentinel_only_when_both_blank() {
        let mut r = SessionRecord::default();
        assert!(r.identity().is_sentinel());
        r.set(Field::SessionCode, "ABC");
        assert!(!r.identity().is_sentinel());
    }

    #[test]
    fn identity_uses_title_without_paper() {
        let mut a = SessionRecord::default();
        a.set(Field::SessionCode, "ABC");
        a.set(Field::Title, "Panel A");
        let mut b = a.clone();
        b.set(Field::Title, "Panel B");
        assert_ne!(a.identity(), b.identity());

        a.set(Field::PaperNo, "2024-01-0001");
        b.set(Field::PaperNo, "2024-01-0001");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn identity_uses_title_for_oral_only_talks() {
        let mut a = SessionRecord::default();
        a.set(Field::SessionCode, "S1");
        a.set(Field::PaperNo, "ORAL ONLY");
        a.set(Field::Title, "Talk A");
        let mut b = a.clone();
        b.set(Field::Title, "Talk B");
        assert_ne!(a.identity(), b.identity());

        b.set(Field::Title, "talk a");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn pairs_are_in_output_order() {
        let r = SessionRecord::default();
        let keys: Vec<&str> = r.to_pairs().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys.first(), Some(&"session_name"));
        assert_eq!(keys.last(), Some(&"source"));
        assert_eq!(keys.len(), 12);
    }
}
