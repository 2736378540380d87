//! Field cleaning, format checks and quality scoring for CV records.
//!
//! Everything here is pure: the engine in [`crate::validation_engine`] loads
//! and persists records around these functions.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::record::{CvFields, IssueKind, ValidationIssue};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9\-]+(\.[a-z0-9\-]+)*\.[a-z]{2,}$")
        .expect("valid email regex")
});

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Per-field completeness weights. They sum to 1.0.
pub const FIELD_WEIGHTS: [(&str, f64); 8] = [
    ("full_name", 0.20),
    ("email", 0.20),
    ("phone", 0.15),
    ("location", 0.10),
    ("headline", 0.10),
    ("skills", 0.15),
    ("experience_years", 0.05),
    ("summary", 0.05),
];

const FORMAT_PENALTY: f64 = 0.1;
const MAX_SKILL_LEN: usize = 64;
const MAX_EXPERIENCE_YEARS: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub valid: bool,
    pub score: f64,
    pub issues: Vec<ValidationIssue>,
}

fn is_invisible(c: char) -> bool {
    c.is_control() || matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Trim, collapse internal whitespace, drop control and zero-width characters.
pub fn clean_text(value: &str) -> String {
    let stripped: String = value
        .chars()
        .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
        .filter(|c| !is_invisible(*c))
        .collect();
    WHITESPACE_RE.replace_all(stripped.trim(), " ").into_owned()
}

fn clean_opt(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(clean_text)
        .filter(|s| !s.is_empty())
}

pub fn normalize_email(value: &str) -> String {
    clean_text(value).replace(' ', "").to_lowercase()
}

/// Keep a leading `+` and the digits; everything else is punctuation.
pub fn normalize_phone(value: &str) -> String {
    let cleaned = clean_text(value);
    let mut out = String::with_capacity(cleaned.len());
    if cleaned.starts_with('+') {
        out.push('+');
    }
    out.extend(cleaned.chars().filter(char::is_ascii_digit));
    out
}

/// Digits only, for blocking and comparison.
pub fn phone_digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// Normalize every field. Applying it twice changes nothing.
pub fn clean_fields(fields: &CvFields) -> CvFields {
    let mut seen = HashSet::new();
    let skills = fields
        .skills
        .iter()
        .map(|s| clean_text(s))
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_lowercase()))
        .collect();

    CvFields {
        full_name: clean_opt(&fields.full_name),
        email: fields
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|s| !s.is_empty()),
        phone: fields
            .phone
            .as_deref()
            .map(normalize_phone)
            .filter(|s| !s.is_empty() && s != "+"),
        location: clean_opt(&fields.location),
        headline: clean_opt(&fields.headline),
        skills,
        experience_years: fields.experience_years.filter(|y| y.is_finite()),
        summary: clean_opt(&fields.summary),
        extra: fields.extra.clone(),
    }
}

fn present(fields: &CvFields, name: &str) -> bool {
    match name {
        "full_name" => fields.full_name.is_some(),
        "email" => fields.email.is_some(),
        "phone" => fields.phone.is_some(),
        "location" => fields.location.is_some(),
        "headline" => fields.headline.is_some(),
        "skills" => !fields.skills.is_empty(),
        "experience_years" => fields.experience_years.is_some(),
        "summary" => fields.summary.is_some(),
        _ => false,
    }
}

/// Weighted share of populated fields, before penalties.
pub fn completeness(fields: &CvFields) -> f64 {
    FIELD_WEIGHTS
        .iter()
        .filter(|(name, _)| present(fields, name))
        .map(|(_, w)| w)
        .sum()
}

/// Populated-or-not for each weighted field.
pub fn field_presence(fields: &CvFields) -> impl Iterator<Item = (&'static str, bool)> + '_ {
    FIELD_WEIGHTS
        .iter()
        .map(move |(name, _)| (*name, present(fields, name)))
}

fn issue(field: &str, kind: IssueKind, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        field: field.to_string(),
        kind,
        message: message.into(),
    }
}

/// Check required fields and formats, and score the record.
///
/// Validity needs a name and at least one well-formed contact. The score is
/// completeness minus a fixed penalty per format violation, clamped to [0, 1].
pub fn assess(fields: &CvFields) -> Assessment {
    let mut issues = Vec::new();

    let name_ok = match fields.full_name.as_deref() {
        None => {
            issues.push(issue("full_name", IssueKind::Missing, "name is required"));
            false
        }
        Some(name) if name.chars().count() < 2 || !name.chars().any(char::is_alphabetic) => {
            issues.push(issue("full_name", IssueKind::Format, "name is not a plausible name"));
            false
        }
        Some(_) => true,
    };

    let email_ok = match fields.email.as_deref() {
        None => false,
        Some(email) if EMAIL_RE.is_match(email) => true,
        Some(_) => {
            issues.push(issue("email", IssueKind::Format, "email is malformed"));
            false
        }
    };

    let phone_ok = match fields.phone.as_deref() {
        None => false,
        Some(phone) => {
            let digits = phone_digits(phone).len();
            if (7..=15).contains(&digits) {
                true
            } else {
                issues.push(issue(
                    "phone",
                    IssueKind::Format,
                    "phone must have between 7 and 15 digits",
                ));
                false
            }
        }
    };

    if fields.email.is_none() && fields.phone.is_none() {
        issues.push(issue(
            "contact",
            IssueKind::Missing,
            "an email or phone number is required",
        ));
    }

    if let Some(years) = fields.experience_years
        && !(0.0..=MAX_EXPERIENCE_YEARS).contains(&years)
    {
        issues.push(issue(
            "experience_years",
            IssueKind::Format,
            format!("experience must be between 0 and {MAX_EXPERIENCE_YEARS} years"),
        ));
    }

    if fields.skills.iter().any(|s| s.chars().count() > MAX_SKILL_LEN) {
        issues.push(issue(
            "skills",
            IssueKind::Format,
            format!("skills must be at most {MAX_SKILL_LEN} characters"),
        ));
    }

    let violations = issues
        .iter()
        .filter(|i| i.kind == IssueKind::Format)
        .count() as f64;
    let score = (completeness(fields) - FORMAT_PENALTY * violations).clamp(0.0, 1.0);

    Assessment {
        valid: name_ok && (email_ok || phone_ok),
        score,
        issues,
    }
}

/// Letter grade for a quality score.
pub fn grade(score: f64) -> &'static str {
    match score {
        s if s >= 0.9 => "A",
        s if s >= 0.75 => "B",
        s if s >= 0.6 => "C",
        s if s >= 0.4 => "D",
        _ => "F",
    }
}

/// Index of the tenth-wide bucket holding `score`; 1.0 falls in the last.
pub fn score_bucket(score: f64) -> usize {
    ((score.clamp(0.0, 1.0) * 10.0) as usize).min(9)
}
