//! Version format transforms
//!
//! Tools rarely print their version exactly as the recipe resolved it. A
//! verify section picks a transform that turns the resolved version into the
//! form the tool prints before it is substituted into the pattern.

use crate::error::VerifyError;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Longest version string accepted for verification.
pub const MAX_VERSION_LEN: usize = 128;

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '(', ')', '[', ']', '{', '}', '\'', '"', '<', '>', '\n', '\\',
];

fn semver_core() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\.\d+\.\d+").expect("regex for semver core"))
}

fn semver_full() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d+\.\d+\.\d+(?:-[0-9A-Za-z.\-]+)?(?:\+[0-9A-Za-z.\-]+)?")
            .expect("regex for full semver")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionFormat {
    /// Use the version unchanged.
    #[default]
    Raw,
    /// Drop one leading `v` or `V`.
    StripV,
    /// First `MAJOR.MINOR.PATCH` in the version.
    Semver,
    /// `MAJOR.MINOR.PATCH` with any `-pre` and `+build` suffix.
    SemverFull,
}

impl VersionFormat {
    /// Look up a format by name, `None` meaning raw.
    ///
    /// Unknown names fall back to raw with a warning, so recipes written for
    /// newer formats still verify.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            None | Some("") | Some("raw") => VersionFormat::Raw,
            Some("strip_v") => VersionFormat::StripV,
            Some("semver") => VersionFormat::Semver,
            Some("semver_full") => VersionFormat::SemverFull,
            Some(other) => {
                tracing::warn!(format = other, "unknown version_format, using raw");
                VersionFormat::Raw
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VersionFormat::Raw => "raw",
            VersionFormat::StripV => "strip_v",
            VersionFormat::Semver => "semver",
            VersionFormat::SemverFull => "semver_full",
        }
    }

    /// Transform `version`. The input is validated first.
    pub fn apply(&self, version: &str) -> Result<String, VerifyError> {
        validate_version_string(version)?;
        let error = |reason: &str| VerifyError::VersionFormat {
            version: version.to_string(),
            format: self.name().to_string(),
            reason: reason.to_string(),
        };

        match self {
            VersionFormat::Raw => Ok(version.to_string()),
            VersionFormat::StripV => Ok(version
                .strip_prefix(['v', 'V'])
                .unwrap_or(version)
                .to_string()),
            VersionFormat::Semver => semver_core()
                .find(version)
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| error("no MAJOR.MINOR.PATCH component")),
            VersionFormat::SemverFull => semver_full()
                .find(version)
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| error("no MAJOR.MINOR.PATCH component")),
        }
    }
}

impl fmt::Display for VersionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reject versions that are too long or could break out of a shell command.
pub fn validate_version_string(version: &str) -> Result<(), VerifyError> {
    let invalid = |reason: String| VerifyError::VersionFormat {
        version: version.to_string(),
        format: "validate".to_string(),
        reason,
    };
    if version.trim().is_empty() {
        return Err(invalid("version is empty".to_string()));
    }
    if version.len() > MAX_VERSION_LEN {
        return Err(invalid(format!(
            "version is longer than {} bytes",
            MAX_VERSION_LEN
        )));
    }
    if version.chars().any(char::is_whitespace) {
        return Err(invalid("version contains whitespace".to_string()));
    }
    if let Some(c) = version.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(invalid(format!("version contains shell metacharacter {:?}", c)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_is_identity() {
        assert_eq!(VersionFormat::Raw.apply("v1.4.0").unwrap(), "v1.4.0");
    }

    #[test]
    fn test_strip_v() {
        let f = VersionFormat::StripV;
        assert_eq!(f.apply("v1.4.0").unwrap(), "1.4.0");
        assert_eq!(f.apply("V2.0").unwrap(), "2.0");
        assert_eq!(f.apply("1.4.0").unwrap(), "1.4.0");
        assert_eq!(f.apply("vv1").unwrap(), "v1");
    }

    #[test]
    fn test_semver_extracts_core() {
        let f = VersionFormat::Semver;
        assert_eq!(f.apply("go1.22.3").unwrap(), "1.22.3");
        assert_eq!(f.apply("1.2.3-rc.1+build.5").unwrap(), "1.2.3");
        assert!(matches!(
            f.apply("latest").unwrap_err(),
            VerifyError::VersionFormat { .. }
        ));
        assert!(f.apply("1.2").is_err());
    }

    #[test]
    fn test_semver_full_keeps_suffixes() {
        let f = VersionFormat::SemverFull;
        assert_eq!(f.apply("v1.2.3-rc.1+build.5").unwrap(), "1.2.3-rc.1+build.5");
        assert_eq!(f.apply("release-2.0.1").unwrap(), "2.0.1");
    }

    #[test]
    fn test_unknown_name_falls_back_to_raw() {
        assert_eq!(VersionFormat::from_name(Some("calver")), VersionFormat::Raw);
        assert_eq!(VersionFormat::from_name(None), VersionFormat::Raw);
        assert_eq!(VersionFormat::from_name(Some("strip_v")), VersionFormat::StripV);
        assert_eq!(VersionFormat::from_name(Some("semver_full")).to_string(), "semver_full");
    }

    #[test]
    fn test_validation() {
        assert!(validate_version_string("1.2.3").is_ok());
        assert!(validate_version_string("@scope/pkg@1.0").is_ok());
        assert!(validate_version_string("").is_err());
        assert!(validate_version_string("1.0; rm -rf /").is_err());
        assert!(validate_version_string("$(whoami)").is_err());
        assert!(validate_version_string(&"1".repeat(MAX_VERSION_LEN + 1)).is_err());
        assert!(validate_version_string(&"1".repeat(MAX_VERSION_LEN)).is_ok());
    }
}
