//! Container image references
//!
//! Parsing follows the normalized reference grammar used by Docker registries:
//!
//! ```text
//! reference := name [ ":" tag ] [ "@" digest ]
//! name      := [ domain "/" ] path-component [ "/" path-component ]*
//! ```
//!
//! Short names are normalized against Docker Hub, so `ubuntu` becomes
//! `docker.io/library/ubuntu:latest`.

use crate::{CrdError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Registry used when a reference carries no domain
pub const DEFAULT_DOMAIN: &str = "docker.io";

const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";
const NAME_TOTAL_LENGTH_MAX: usize = 255;

static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?$",
    )
    .expect("domain pattern is valid")
});

static REMAINDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<path>[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*)(?::(?P<tag>[\w][\w.-]{0,127}))?(?:@(?P<digest>[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}))?$",
    )
    .expect("reference pattern is valid")
});

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("identifier pattern is valid"));

/// A parsed, normalized image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry domain, including port if any
    pub domain: String,
    /// Repository path within the registry
    pub path: String,
    /// Tag, if one was given
    pub tag: Option<String>,
    /// Content digest, if one was given
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize a reference such as `alpine`, `quay.io/org/app:v1`
    /// or `localhost:5000/app@sha256:...`
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| CrdError::InvalidImage {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if IDENTIFIER.is_match(reference) {
            return Err(invalid(
                "cannot specify 64-byte hexadecimal strings as a repository name",
            ));
        }

        let (domain, remainder) = split_domain(reference);
        let name_part = remainder
            .split(['@', ':'])
            .next()
            .unwrap_or(remainder.as_str());
        if name_part.to_ascii_lowercase() != name_part {
            return Err(invalid("repository name must be lowercase"));
        }
        if !DOMAIN.is_match(&domain) {
            return Err(invalid("invalid reference format"));
        }

        let caps = REMAINDER
            .captures(&remainder)
            .ok_or_else(|| invalid("invalid reference format"))?;
        let path = caps.name("path").map(|m| m.as_str()).unwrap_or_default();

        if domain.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(invalid("repository name must not be more than 255 characters"));
        }

        Ok(Self {
            domain,
            path: path.to_string(),
            tag: caps.name("tag").map(|m| m.as_str().to_string()),
            digest: caps.name("digest").map(|m| m.as_str().to_string()),
        })
    }

    /// Fully qualified repository name (`domain/path`)
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Tag, defaulting to `latest` when neither tag nor digest was given
    pub fn tag_or_default(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag),
            (None, None) => Some(DEFAULT_TAG),
            (None, Some(_)) => None,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = self.tag_or_default() {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Split off the registry domain, applying Docker Hub defaults
fn split_domain(reference: &str) -> (String, String) {
    let (mut domain, mut remainder) = match reference.split_once('/') {
        Some((first, rest))
            if first.contains(['.', ':'])
                || first == "localhost"
                || first.to_ascii_lowercase() != first =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), reference.to_string()),
    };

    if domain == LEGACY_DEFAULT_DOMAIN {
        domain = DEFAULT_DOMAIN.to_string();
    }
    if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        remainder = format!("{}{}", OFFICIAL_REPO_PREFIX, remainder);
    }
    (domain, remainder)
}

/// Check that an image reference parses
pub fn validate_image(reference: &str) -> Result<()> {
    ImageReference::parse(reference).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_image_normalized() {
        let image = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(image.domain, "docker.io");
        assert_eq!(image.path, "library/ubuntu");
        assert_eq!(image.to_string(), "docker.io/library/ubuntu:latest");

        let image = ImageReference::parse("ubuntu:22.04").unwrap();
        assert_eq!(image.tag.as_deref(), Some("22.04"));
    }

    #[test]
    fn test_registry_references() {
        let image =
            ImageReference::parse("quay.io/tinkerbell-actions/image2disk:v1.0.0").unwrap();
        assert_eq!(image.domain, "quay.io");
        assert_eq!(image.path, "tinkerbell-actions/image2disk");
        assert_eq!(image.tag.as_deref(), Some("v1.0.0"));

        let image = ImageReference::parse("localhost:5000/actions/wipe").unwrap();
        assert_eq!(image.domain, "localhost:5000");
        assert_eq!(image.to_string(), "localhost:5000/actions/wipe:latest");

        let image = ImageReference::parse("index.docker.io/busybox").unwrap();
        assert_eq!(image.name(), "docker.io/library/busybox");
    }

    #[test]
    fn test_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let image = ImageReference::parse(&format!("alpine@{}", digest)).unwrap();
        assert_eq!(image.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(image.tag_or_default(), None);
        assert_eq!(image.to_string(), format!("docker.io/library/alpine@{}", digest));
    }

    #[test]
    fn test_invalid_references() {
        for bad in [
            "bad image!",
            "",
            "Ubuntu",
            "docker.io/Library/ubuntu",
            "ubuntu:",
            "ubuntu::tag",
            "-leading/dash",
            "quay.io/org/app:-tag",
        ] {
            assert!(
                matches!(ImageReference::parse(bad), Err(CrdError::InvalidImage { .. })),
                "expected '{}' to be rejected",
                bad
            );
        }

        let hex = "f".repeat(64);
        assert!(ImageReference::parse(&hex).is_err());

        let long = format!("quay.io/{}", "a".repeat(260));
        assert!(ImageReference::parse(&long).is_err());
    }
}
