use regex::Regex;

use crate::core::Severity;

/// Sentinel some upstream parsers emit for an unresolvable path. Never a
/// real file.
pub const PATH_SENTINEL: &str = "<unknown>";

/// A record of an input the engine intentionally skipped or degraded. The
/// only diagnostic surface for partial-failure data loss.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationEntry {
    pub commit_oid: Option<String>,
    pub stage: String,
    pub reason: String,
    pub severity: Severity,
    pub detail: Option<String>,
}

impl ValidationEntry {
    pub fn warn<S: Into<String>, R: Into<String>>(
        commit_oid: Option<String>,
        stage: S,
        reason: R,
        detail: Option<String>,
    ) -> Self {
        Self { commit_oid, stage: stage.into(), reason: reason.into(), severity: Severity::Warn, detail }
    }
}

/// Why a path was rejected. Stored verbatim as the ValidationLog reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PathRejection {
    ChangeCodeAsPath,
    EmailAsPath,
    SentinelAsPath,
    ControlCharacterInPath,
    EmptyPath,
}

/// Validates candidate file paths before they may become entities. These
/// rules exist because malformed parse output has contaminated downstream
/// math in the field: a stray status letter or an author email showing up
/// where a path belongs must never earn an entity id.
#[derive(Debug, Clone)]
pub struct PathValidator {
    email: Regex,
}

impl Default for PathValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl PathValidator {
    pub fn new() -> Self {
        let email = Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
            .expect("email pattern is valid");
        Self { email }
    }

    pub fn check(&self, path: &str) -> Result<(), PathRejection> {
        if path.is_empty() {
            return Err(PathRejection::EmptyPath);
        }

        if matches!(path, "A" | "M" | "D") {
            return Err(PathRejection::ChangeCodeAsPath);
        }

        if path == PATH_SENTINEL {
            return Err(PathRejection::SentinelAsPath);
        }

        if self.email.is_match(path) {
            return Err(PathRejection::EmailAsPath);
        }

        if path.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return Err(PathRejection::ControlCharacterInPath);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_paths() {
        let validator = PathValidator::new();
        assert!(validator.check("src/main.rs").is_ok());
        assert!(validator.check("a").is_ok());
        assert!(validator.check("M.java").is_ok());
        assert!(validator.check("docs/notes@2024.md").is_ok());
    }

    #[test]
    fn rejects_change_code_characters() {
        let validator = PathValidator::new();
        assert_eq!(validator.check("A"), Err(PathRejection::ChangeCodeAsPath));
        assert_eq!(validator.check("M"), Err(PathRejection::ChangeCodeAsPath));
        assert_eq!(validator.check("D"), Err(PathRejection::ChangeCodeAsPath));
    }

    #[test]
    fn rejects_email_shaped_paths() {
        let validator = PathValidator::new();
        assert_eq!(validator.check("user@example.com"), Err(PathRejection::EmailAsPath));
        assert_eq!(
            validator.check("first.last+tag@sub.domain.org"),
            Err(PathRejection::EmailAsPath)
        );
    }

    #[test]
    fn rejects_sentinel_and_control_characters() {
        let validator = PathValidator::new();
        assert_eq!(validator.check(PATH_SENTINEL), Err(PathRejection::SentinelAsPath));
        assert_eq!(validator.check("src/\x07bell.rs"), Err(PathRejection::ControlCharacterInPath));
        assert_eq!(validator.check("a\tb"), Err(PathRejection::ControlCharacterInPath));
        assert_eq!(validator.check(""), Err(PathRejection::EmptyPath));
    }

    #[test]
    fn rejection_reason_is_snake_case() {
        assert_eq!(PathRejection::EmailAsPath.to_string(), "email_as_path");
    }
}
