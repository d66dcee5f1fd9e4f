//! Image revision specs.
//!
//! A [`RevisionSpec`] addresses an image in the engine. The human grammar is:
//!
//! ```text
//! revspec = [ owner "/" ] repository [ ":" ( tag | revision ) ]
//!         | revision ;
//! ```
//!
//! where a revision is exactly 12 or 64 hexadecimal characters. Anything else
//! in the revision/tag position is a tag.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

/// Tag given to specs that name a repository without a tag or revision.
pub const LATEST_TAG: &str = "latest";

/// Placeholder the engine prints for a missing repository or tag.
const NONE_PLACEHOLDER: &str = "<none>";

/// Errors produced while parsing a revision spec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevisionSpecError {
    #[error("invalid revision spec {spec:?}: {reason}")]
    Invalid { spec: String, reason: String },
}

impl RevisionSpecError {
    fn invalid(spec: &str, reason: &str) -> Self {
        RevisionSpecError::Invalid {
            spec: spec.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for revision spec parsing.
pub type Result<T> = std::result::Result<T, RevisionSpecError>;

fn revision_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("^([0-9a-fA-F]{12}|[0-9a-fA-F]{64})$").expect("static revision regex")
    })
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static whitespace regex"))
}

/// Whether `token` is lexically a content revision (12 or 64 hex chars).
pub fn is_revision(token: &str) -> bool {
    revision_regex().is_match(token)
}

/// Split `owner/repo` (or `repo`) into its parts.
///
/// A leading `/` yields neither part; the engine's `<none>` placeholder yields
/// no repository.
fn split_owner_and_repository(text: &str) -> (Option<String>, Option<String>) {
    match text.find('/') {
        Some(0) => (None, None),
        Some(idx) => (
            Some(text[..idx].to_string()),
            Some(text[idx + 1..].to_string()),
        ),
        None if text == NONE_PLACEHOLDER || text.is_empty() => (None, None),
        None => (None, Some(text.to_string())),
    }
}

/// Identifier of an image: optional owner, repository, revision and tag.
///
/// Equality is deliberately asymmetric in revision and tag: owner and
/// repository must match literally, then revisions are compared when both
/// sides carry one, tags otherwise. This lets a tag-only spec match the fully
/// resolved spec read back from the engine. The relation is not transitive,
/// so `RevisionSpec` implements `PartialEq` only.
#[derive(Debug, Clone, Default)]
pub struct RevisionSpec {
    owner: Option<String>,
    repository: Option<String>,
    revision: Option<String>,
    tag: Option<String>,
}

impl RevisionSpec {
    pub fn new(
        owner: Option<String>,
        repository: Option<String>,
        revision: Option<String>,
        tag: Option<String>,
    ) -> Self {
        Self {
            owner,
            repository,
            revision,
            tag,
        }
    }

    /// A spec with no field set, used to commit intermediate images.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Parse the human form of a spec (see the module docs for the grammar).
    pub fn parse(spec: &str) -> Result<Self> {
        let last = spec.len().checked_sub(1);
        let rev_separator = spec.find(':');

        if last.is_some() && spec.find('/') == last {
            return Err(RevisionSpecError::invalid(spec, "missing repository"));
        }
        if last.is_some() && rev_separator == last {
            return Err(RevisionSpecError::invalid(spec, "missing revision"));
        }

        let mut revision = None;
        let mut tag = None;
        let mut owner_and_repository = "";

        match rev_separator {
            Some(idx) => {
                let rev_or_tag = &spec[idx + 1..];
                if is_revision(rev_or_tag) {
                    revision = Some(rev_or_tag.to_string());
                } else {
                    tag = Some(rev_or_tag.to_string());
                }
                owner_and_repository = &spec[..idx];
            }
            None if !is_revision(spec) => {
                owner_and_repository = spec;
                tag = Some(LATEST_TAG.to_string());
            }
            None => revision = Some(spec.to_string()),
        }

        let (mut owner, mut repository) = (None, None);
        if !owner_and_repository.is_empty() {
            (owner, repository) = split_owner_and_repository(owner_and_repository);
            if owner.is_none() && repository.is_none() {
                return Err(RevisionSpecError::invalid(spec, "missing owner"));
            }
        }

        if tag.is_some() && owner_and_repository.is_empty() {
            return Err(RevisionSpecError::invalid(spec, "tag without repository"));
        }

        Ok(Self {
            owner,
            repository,
            revision,
            tag,
        })
    }

    /// Parse one line of the engine's tabular image listing.
    ///
    /// Columns are repository, tag, revision and age; a line starting with
    /// whitespace has no repository column, and `<none>` stands for a missing
    /// repository or tag. The age column is ignored.
    pub fn parse_from_engine_listing(line: &str) -> Result<Self> {
        let (mut owner, mut repository, mut revision, mut tag) = (None, None, None, None);

        if let Some(first) = line.chars().next() {
            let parts: Vec<&str> = whitespace_regex().splitn(line, 4).collect();
            if !first.is_whitespace() {
                (owner, repository) = split_owner_and_repository(parts[0]);
                if let Some(second) = parts.get(1) {
                    if is_revision(second) {
                        revision = Some(second.to_string());
                    } else {
                        if *second != NONE_PLACEHOLDER {
                            tag = Some(second.to_string());
                        }
                        revision = parts.get(2).map(|s| s.to_string());
                    }
                }
            } else if let Some(second) = parts.get(1) {
                revision = Some(second.to_string());
            }
        }

        match revision {
            Some(revision) if is_revision(&revision) => Ok(Self {
                owner,
                repository,
                revision: Some(revision),
                tag,
            }),
            _ => Err(RevisionSpecError::invalid(line, "can't find the revision")),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// `owner/repository`, `repository` when there is no owner, `None` when
    /// there is no repository.
    pub fn fully_qualified_name(&self) -> Option<String> {
        match (&self.owner, &self.repository) {
            (Some(owner), Some(repository)) => Some(format!("{owner}/{repository}")),
            (None, Some(repository)) => Some(repository.clone()),
            _ => None,
        }
    }

    /// Copy of this spec carrying `tag` instead of the current one.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..self.clone()
        }
    }
}

impl PartialEq for RevisionSpec {
    fn eq(&self, other: &Self) -> bool {
        if self.owner != other.owner || self.repository != other.repository {
            return false;
        }
        match (&self.revision, &other.revision) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => self.tag == other.tag,
        }
    }
}

impl fmt::Display for RevisionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if let Some(owner) = &self.owner {
            out.push_str(owner);
            out.push('/');
        }
        if let Some(repository) = &self.repository {
            out.push_str(repository);
        }
        match (&self.tag, &self.revision) {
            (Some(tag), revision) => {
                out.push(':');
                out.push_str(tag);
                if let Some(revision) = revision {
                    out.push_str(&format!(" ({revision})"));
                }
            }
            (None, revision) => {
                if !out.is_empty() {
                    out.push(':');
                }
                out.push_str(revision.as_deref().unwrap_or_default());
            }
        }
        f.write_str(&out)
    }
}

impl FromStr for RevisionSpec {
    type Err = RevisionSpecError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: &str = "33b6d177c4bd";
    const LONG: &str = "71bed3ad1135a3c48c7f85bdcaead44e6bdf2c722caae375764fa38a4949d625";

    fn fields(spec: &RevisionSpec) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
        (spec.owner(), spec.repository(), spec.revision(), spec.tag())
    }

    #[test]
    fn test_parse_human_forms() {
        let long_colon = format!(":{LONG}");
        let repo_long = format!("repo:{LONG}");
        let cases: Vec<(&str, (Option<&str>, Option<&str>, Option<&str>, Option<&str>))> = vec![
            (":33b6d177c4bd", (None, None, Some(SHORT), None)),
            (SHORT, (None, None, Some(SHORT), None)),
            (long_colon.as_str(), (None, None, Some(LONG), None)),
            (LONG, (None, None, Some(LONG), None)),
            ("repo:1234", (None, Some("repo"), None, Some("1234"))),
            ("user/repo:1234", (Some("user"), Some("repo"), None, Some("1234"))),
            ("user/repo", (Some("user"), Some("repo"), None, Some("latest"))),
            (repo_long.as_str(), (None, Some("repo"), Some(LONG), None)),
            (
                "user/repo:33b6d177c4bd",
                (Some("user"), Some("repo"), Some(SHORT), None),
            ),
            ("user/repo:latest", (Some("user"), Some("repo"), None, Some("latest"))),
            (
                "user/repo:latest/v1",
                (Some("user"), Some("repo"), None, Some("latest/v1")),
            ),
            (
                "user/repo:latest:v1",
                (Some("user"), Some("repo"), None, Some("latest:v1")),
            ),
            (
                "user/repo/toto",
                (Some("user"), Some("repo/toto"), None, Some("latest")),
            ),
        ];

        for (input, expected) in cases {
            let spec = RevisionSpec::parse(input)
                .unwrap_or_else(|e| panic!("{input:?} should parse: {e}"));
            assert_eq!(fields(&spec), expected, "parsing {input:?}");
        }
    }

    #[test]
    fn test_parse_rejects_malformed_specs() {
        for input in ["", ":", "/", "/:", ":/", ":1234", ":user/repo", "/repo"] {
            let err = RevisionSpec::parse(input).expect_err(input);
            assert!(err.to_string().contains("invalid revision spec"));
        }
    }

    #[test]
    fn test_parse_error_reasons() {
        let reason = |input: &str| match RevisionSpec::parse(input) {
            Err(RevisionSpecError::Invalid { reason, .. }) => reason,
            Ok(spec) => panic!("{input:?} parsed as {spec:?}"),
        };
        assert_eq!(reason("user/"), "missing repository");
        assert_eq!(reason("user/repo:"), "missing revision");
        assert_eq!(reason(":1234"), "tag without repository");
    }

    #[test]
    fn test_parse_engine_listing() {
        let cases = [
            (" 33b6d177c4bd", (None, None, Some(SHORT), None)),
            (" 33b6d177c4bd just now", (None, None, Some(SHORT), None)),
            (
                "base latest 33b6d177c4bd 3 weeks ago",
                (None, Some("base"), Some(SHORT), Some("latest")),
            ),
            (
                "<none> <none> 33b6d177c4bd 3 weeks ago",
                (None, None, Some(SHORT), None),
            ),
            ("<none> <none> 33b6d177c4bd", (None, None, Some(SHORT), None)),
            (
                "base latest 33b6d177c4bd",
                (None, Some("base"), Some(SHORT), Some("latest")),
            ),
            ("base 33b6d177c4bd", (None, Some("base"), Some(SHORT), None)),
            (
                "base 33b6d177c4bd 3 weeks ago",
                (None, Some("base"), Some(SHORT), None),
            ),
            (
                "lopter/raring-base 33b6d177c4bd 3 weeks ago",
                (Some("lopter"), Some("raring-base"), Some(SHORT), None),
            ),
            (
                "lopter/raring-base     latest     33b6d177c4bd     3 weeks ago",
                (Some("lopter"), Some("raring-base"), Some(SHORT), Some("latest")),
            ),
        ];

        for (line, expected) in cases {
            let spec = RevisionSpec::parse_from_engine_listing(line)
                .unwrap_or_else(|e| panic!("{line:?} should parse: {e}"));
            assert_eq!(fields(&spec), expected, "parsing {line:?}");
        }
    }

    #[test]
    fn test_parse_engine_listing_rejects_lines_without_revision() {
        for line in ["", "base", " latest 33b6d177c4bd just now", "base latest"] {
            assert!(
                RevisionSpec::parse_from_engine_listing(line).is_err(),
                "{line:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_display_forms() {
        let tagged = RevisionSpec::new(
            Some("user".into()),
            Some("repo".into()),
            Some(SHORT.into()),
            Some("latest".into()),
        );
        assert_eq!(tagged.to_string(), format!("user/repo:latest ({SHORT})"));

        let revision_only = RevisionSpec::new(
            Some("user".into()),
            Some("repo".into()),
            Some(SHORT.into()),
            None,
        );
        assert_eq!(revision_only.to_string(), format!("user/repo:{SHORT}"));

        let bare = RevisionSpec::new(None, None, Some(SHORT.into()), None);
        assert_eq!(bare.to_string(), SHORT);

        assert_eq!(RevisionSpec::anonymous().to_string(), "");
    }

    #[test]
    fn test_display_then_parse_is_equivalent() {
        for input in ["user/repo:1234", "repo:latest", "user/repo", SHORT, "user/repo:33b6d177c4bd"] {
            let spec = RevisionSpec::parse(input).unwrap();
            let reparsed = RevisionSpec::parse(&spec.to_string()).unwrap();
            assert_eq!(spec, reparsed, "round-trip of {input:?}");
        }
    }

    #[test]
    fn test_fully_qualified_name() {
        let spec = RevisionSpec::parse("user/repo:tag").unwrap();
        assert_eq!(spec.fully_qualified_name().as_deref(), Some("user/repo"));

        let spec = RevisionSpec::parse("repo:tag").unwrap();
        assert_eq!(spec.fully_qualified_name().as_deref(), Some("repo"));

        let spec = RevisionSpec::parse(SHORT).unwrap();
        assert_eq!(spec.fully_qualified_name(), None);
    }

    #[test]
    fn test_tag_matches_resolved_revision() {
        let loose = RevisionSpec::parse("base").unwrap();
        let resolved =
            RevisionSpec::parse_from_engine_listing("base latest 33b6d177c4bd 3 weeks ago")
                .unwrap();
        assert_eq!(loose, resolved);
        assert_eq!(resolved, loose);

        let by_revision = RevisionSpec::parse("base:33b6d177c4bd").unwrap();
        assert_eq!(by_revision, resolved);

        let other_revision = RevisionSpec::parse("base:aaaaaaaaaaaa").unwrap();
        assert_ne!(other_revision, resolved);
    }

    #[test]
    fn test_different_repositories_never_match() {
        let a = RevisionSpec::parse("user/repo:33b6d177c4bd").unwrap();
        let b = RevisionSpec::parse("other/repo:33b6d177c4bd").unwrap();
        let c = RevisionSpec::parse("user/other:33b6d177c4bd").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_with_tag_keeps_other_fields() {
        let spec = RevisionSpec::new(None, Some("app-api".into()), Some(SHORT.into()), Some("ts-1".into()));
        let retagged = spec.with_tag("latest");
        assert_eq!(retagged.repository(), Some("app-api"));
        assert_eq!(retagged.revision(), Some(SHORT));
        assert_eq!(retagged.tag(), Some("latest"));
        assert_eq!(spec.tag(), Some("ts-1"));
    }

    #[test]
    fn test_from_str() {
        let spec: RevisionSpec = "user/repo:v2".parse().unwrap();
        assert_eq!(spec.tag(), Some("v2"));
        assert!("".parse::<RevisionSpec>().is_err());
    }
}
