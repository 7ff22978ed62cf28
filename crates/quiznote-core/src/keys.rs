//! Key codec for scope tokens, record keys and the composite primary keys
//! derived from them.
//!
//! A record's primary key is `scope_token + "_" + record_key`. Scope tokens are
//! either `course_class_assignment` or the degraded `page_<base36>` form, and
//! record keys never contain the separator, so every primary key splits back
//! into exactly one `(scope, record)` pair at its last separator.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const KEY_SEPARATOR: char = '_';

const MISTAKE_KEY_SUFFIX: &str = "mistake";
const PAGE_SCOPE_PREFIX: &str = "page";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("scope component `{component}` is empty")]
    EmptyComponent { component: &'static str },
    #[error("scope component `{component}` contains the key separator: {value}")]
    SeparatorInComponent { component: &'static str, value: String },
    #[error("record key is empty")]
    EmptyRecordKey,
    #[error("record key contains the key separator: {0}")]
    SeparatorInRecordKey(String),
    #[error("unrecognized scope token: {0}")]
    UnrecognizedScope(String),
}

/// Partition identifier for notes and mistake counters.
///
/// Only constructed through [`ScopeKey::assignment`], [`ScopeKey::from_page_path`],
/// [`ScopeKey::derive`] and [`ScopeKey::parse`], so every value round-trips
/// through its token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeKey(ScopeKind);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum ScopeKind {
    Assignment { course_id: String, class_id: String, assignment_id: String },
    /// Stable per page path; used when the page does not expose all three ids.
    Page { digest: String },
}

impl ScopeKey {
    /// Build an assignment scope from its three ids.
    ///
    /// # Errors
    /// Returns an error when a component is empty or contains the key separator.
    pub fn assignment(
        course_id: impl Into<String>,
        class_id: impl Into<String>,
        assignment_id: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let course_id = checked_component("course_id", course_id.into())?;
        let class_id = checked_component("class_id", class_id.into())?;
        let assignment_id = checked_component("assignment_id", assignment_id.into())?;
        Ok(Self(ScopeKind::Assignment { course_id, class_id, assignment_id }))
    }

    /// Degraded scope derived from the page path alone.
    #[must_use]
    pub fn from_page_path(path: &str) -> Self {
        Self(ScopeKind::Page { digest: to_base36(page_path_hash(path).unsigned_abs()) })
    }

    /// Use the assignment ids when all three are usable, otherwise fall back to
    /// the page path. Distinct pages that share a path share the fallback scope.
    #[must_use]
    pub fn derive(
        course_id: Option<&str>,
        class_id: Option<&str>,
        assignment_id: Option<&str>,
        page_path: &str,
    ) -> Self {
        if let (Some(course), Some(class), Some(assignment)) = (course_id, class_id, assignment_id) {
            if let Ok(scope) = Self::assignment(course, class, assignment) {
                return scope;
            }
        }
        Self::from_page_path(page_path)
    }

    /// Parse a serialized scope token.
    ///
    /// # Errors
    /// Returns an error when the token is neither an assignment nor a page scope.
    pub fn parse(token: &str) -> Result<Self, KeyError> {
        let parts = token.split(KEY_SEPARATOR).collect::<Vec<_>>();
        match parts.as_slice() {
            [PAGE_SCOPE_PREFIX, digest] if is_base36(digest) => {
                Ok(Self(ScopeKind::Page { digest: (*digest).to_string() }))
            }
            [course, class, assignment] => Self::assignment(*course, *class, *assignment)
                .map_err(|_| KeyError::UnrecognizedScope(token.to_string())),
            _ => Err(KeyError::UnrecognizedScope(token.to_string())),
        }
    }

    #[must_use]
    pub fn token(&self) -> String {
        self.to_string()
    }

    #[must_use]
    pub fn course_id(&self) -> Option<&str> {
        match &self.0 {
            ScopeKind::Assignment { course_id, .. } => Some(course_id),
            ScopeKind::Page { .. } => None,
        }
    }

    #[must_use]
    pub fn class_id(&self) -> Option<&str> {
        match &self.0 {
            ScopeKind::Assignment { class_id, .. } => Some(class_id),
            ScopeKind::Page { .. } => None,
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self.0, ScopeKind::Page { .. })
    }
}

impl Display for ScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            ScopeKind::Assignment { course_id, class_id, assignment_id } => {
                write!(f, "{course_id}{KEY_SEPARATOR}{class_id}{KEY_SEPARATOR}{assignment_id}")
            }
            ScopeKind::Page { digest } => write!(f, "{PAGE_SCOPE_PREFIX}{KEY_SEPARATOR}{digest}"),
        }
    }
}

impl TryFrom<String> for ScopeKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ScopeKey> for String {
    fn from(value: ScopeKey) -> Self {
        value.token()
    }
}

/// Identifies one question within an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    /// # Errors
    /// Returns an error when the key is empty or contains the key separator.
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        if value.is_empty() {
            return Err(KeyError::EmptyRecordKey);
        }
        if value.contains(KEY_SEPARATOR) {
            return Err(KeyError::SeparatorInRecordKey(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordKey> for String {
    fn from(value: RecordKey) -> Self {
        value.0
    }
}

/// Level at which a bulk query filters scopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Exact,
    Course,
    Class,
    All,
}

impl Granularity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Course => "course",
            Self::Class => "class",
            Self::All => "all",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(Self::Exact),
            "course" => Some(Self::Course),
            "class" => Some(Self::Class),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Whether `candidate` falls inside `anchor` at this granularity.
    ///
    /// Fallback page scopes carry no course or class, so course and class
    /// queries anchored on them only match the page itself.
    #[must_use]
    pub fn matches(self, anchor: &ScopeKey, candidate: &ScopeKey) -> bool {
        match (self, &anchor.0) {
            (Self::All, _) => true,
            (Self::Exact, _) | (Self::Course | Self::Class, ScopeKind::Page { .. }) => {
                anchor == candidate
            }
            (Self::Course, ScopeKind::Assignment { course_id, .. }) => {
                candidate.course_id() == Some(course_id.as_str())
            }
            (Self::Class, ScopeKind::Assignment { course_id, class_id, .. }) => {
                candidate.course_id() == Some(course_id.as_str())
                    && candidate.class_id() == Some(class_id.as_str())
            }
        }
    }
}

#[must_use]
pub fn note_key(scope: &ScopeKey, record: &RecordKey) -> String {
    format!("{scope}{KEY_SEPARATOR}{record}")
}

#[must_use]
pub fn mistake_key(scope: &ScopeKey, record: &RecordKey) -> String {
    format!("{scope}{KEY_SEPARATOR}{record}{KEY_SEPARATOR}{MISTAKE_KEY_SUFFIX}")
}

/// Split a note primary key back into its scope token and record key.
#[must_use]
pub fn split_note_key(primary_key: &str) -> Option<(&str, &str)> {
    let (scope, record) = primary_key.rsplit_once(KEY_SEPARATOR)?;
    if scope.is_empty() || record.is_empty() {
        return None;
    }
    Some((scope, record))
}

fn checked_component(component: &'static str, value: String) -> Result<String, KeyError> {
    if value.is_empty() {
        return Err(KeyError::EmptyComponent { component });
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(KeyError::SeparatorInComponent { component, value });
    }
    Ok(value)
}

/// `h = ((h << 5) - h) + unit` over UTF-16 code units, where the shift sees
/// `h` truncated to 32 bits and the subtraction does not.
fn page_path_hash(path: &str) -> i64 {
    path.encode_utf16().fold(0_i64, |acc, unit| {
        // Truncation to the low 32 bits is the point here.
        #[allow(clippy::cast_possible_truncation)]
        let shifted = i64::from((acc as i32).wrapping_shl(5));
        shifted - acc + i64::from(unit)
    })
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        // value % 36 < 36
        #[allow(clippy::cast_possible_truncation)]
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn is_base36(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}
