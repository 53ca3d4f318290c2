//! Event filter expressions
//!
//! A small predicate language for the `--filter` option. An expression is a
//! whitespace-separated list of terms, all of which must match; a leading
//! `!` negates a term.
//!
//! Terms:
//! - `reason=TOKEN[,TOKEN...]`: any listed reason token is present
//! - `ext=EXT[,EXT...]`: the filename has one of the extensions
//! - `path~SUBSTR`: full path (or filename when unresolved) contains SUBSTR
//! - `name~SUBSTR`: filename contains SUBSTR
//! - `dir=true|false`: directory flag
//!
//! Path, name, and extension matching is case-insensitive.

use crate::error::{Result, WatcherError};
use crate::event::ChangeEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Reason(Vec<String>),
    Extension(Vec<String>),
    PathContains(String),
    NameContains(String),
    IsDirectory(bool),
}

impl Term {
    fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Term::Reason(tokens) => {
                let present = event.reason_tokens();
                tokens.iter().any(|t| present.contains(&t.as_str()))
            }
            Term::Extension(exts) => {
                let name = event.file_name.to_ascii_lowercase();
                match name.rsplit_once('.') {
                    Some((_, ext)) => exts.iter().any(|e| e == ext),
                    None => false,
                }
            }
            Term::PathContains(needle) => {
                let haystack = event
                    .full_path
                    .as_deref()
                    .unwrap_or(&event.file_name)
                    .to_ascii_lowercase();
                haystack.contains(needle)
            }
            Term::NameContains(needle) => {
                event.file_name.to_ascii_lowercase().contains(needle)
            }
            Term::IsDirectory(wanted) => event.is_directory == *wanted,
        }
    }
}

/// A parsed filter expression: the conjunction of its terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpr {
    terms: Vec<(bool, Term)>,
}

impl FilterExpr {
    /// Parse an expression. Empty input is an error; use `None` upstream for
    /// "no filter".
    pub fn parse(input: &str) -> Result<Self> {
        let mut terms = Vec::new();

        for raw in input.split_whitespace() {
            let (negated, body) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            terms.push((negated, Self::parse_term(body)?));
        }

        if terms.is_empty() {
            return Err(WatcherError::Filter("empty expression".to_string()));
        }
        Ok(Self { terms })
    }

    fn parse_term(body: &str) -> Result<Term> {
        if let Some(value) = body.strip_prefix("reason=") {
            let tokens: Vec<String> = value
                .split(',')
                .filter(|t| !t.is_empty())
                .map(|t| t.to_ascii_uppercase())
                .collect();
            if tokens.is_empty() {
                return Err(WatcherError::Filter(format!("no reason tokens in '{}'", body)));
            }
            return Ok(Term::Reason(tokens));
        }
        if let Some(value) = body.strip_prefix("ext=") {
            let exts: Vec<String> = value
                .split(',')
                .filter(|e| !e.is_empty())
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect();
            if exts.is_empty() {
                return Err(WatcherError::Filter(format!("no extensions in '{}'", body)));
            }
            return Ok(Term::Extension(exts));
        }
        if let Some(value) = body.strip_prefix("path~") {
            return Ok(Term::PathContains(value.to_ascii_lowercase()));
        }
        if let Some(value) = body.strip_prefix("name~") {
            return Ok(Term::NameContains(value.to_ascii_lowercase()));
        }
        if let Some(value) = body.strip_prefix("dir=") {
            return match value {
                "true" => Ok(Term::IsDirectory(true)),
                "false" => Ok(Term::IsDirectory(false)),
                other => Err(WatcherError::Filter(format!("dir= expects true|false, got '{}'", other))),
            };
        }

        Err(WatcherError::Filter(format!("unrecognized term '{}'", body)))
    }

    /// Does the event pass the filter?
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.terms
            .iter()
            .all(|(negated, term)| term.matches(event) != *negated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structs::usn_reason;
    use chrono::{TimeZone, Utc};

    fn event(reason: u32, name: &str, path: Option<&str>, is_dir: bool) -> ChangeEvent {
        ChangeEvent {
            usn: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            frn: 0x55,
            parent_frn: 0x10,
            file_name: name.to_string(),
            full_path: path.map(String::from),
            old_path: None,
            new_path: None,
            reason_raw: reason,
            is_directory: is_dir,
            attributes: 0,
        }
    }

    #[test]
    fn reason_term_matches_any_listed_token() {
        let filter = FilterExpr::parse("reason=FILECREATE,FILEDELETE").unwrap();
        assert!(filter.matches(&event(usn_reason::FILE_CREATE, "a.txt", None, false)));
        assert!(filter.matches(&event(usn_reason::FILE_DELETE, "a.txt", None, false)));
        assert!(!filter.matches(&event(usn_reason::CLOSE, "a.txt", None, false)));
    }

    #[test]
    fn extension_term_is_case_insensitive() {
        let filter = FilterExpr::parse("ext=log,tmp").unwrap();
        assert!(filter.matches(&event(0, "APP.LOG", None, false)));
        assert!(filter.matches(&event(0, "x.tmp", None, false)));
        assert!(!filter.matches(&event(0, "x.txt", None, false)));
        assert!(!filter.matches(&event(0, "noext", None, false)));
    }

    #[test]
    fn path_term_falls_back_to_filename() {
        let filter = FilterExpr::parse("path~temp").unwrap();
        assert!(filter.matches(&event(0, "a.txt", Some(r"C:\Temp\a.txt"), false)));
        assert!(filter.matches(&event(0, "temp-a.txt", None, false)));
        assert!(!filter.matches(&event(0, "a.txt", Some(r"C:\data\a.txt"), false)));
    }

    #[test]
    fn terms_are_conjunctive_and_negatable() {
        let filter = FilterExpr::parse("reason=CLOSE !dir=true").unwrap();
        assert!(filter.matches(&event(usn_reason::CLOSE, "a.txt", None, false)));
        assert!(!filter.matches(&event(usn_reason::CLOSE, "a", None, true)));
        assert!(!filter.matches(&event(usn_reason::FILE_CREATE, "a.txt", None, false)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(FilterExpr::parse("").is_err());
        assert!(FilterExpr::parse("bogus").is_err());
        assert!(FilterExpr::parse("dir=maybe").is_err());
        assert!(FilterExpr::parse("reason=").is_err());
    }
}
