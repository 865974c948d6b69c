//! Image references and distribution paths.
//!
//! An image reference has the form `registry/repository[:tag][@digest]`.
//! The parsed [`Image`] is immutable; the derived [`DistributionPath`]
//! addresses the manifest or blob resource under the registry's `/v2/` API.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Content digest in `<algorithm>:<hex>` form.
///
/// The hex length must match the algorithm (sha256 -> 64, sha512 -> 128)
/// and only lowercase hex characters are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    pub fn parse(input: &str) -> Result<Self> {
        let Some((algorithm, encoded)) = input.split_once(':') else {
            return Err(Error::InvalidDigest);
        };
        let expected_len = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            _ => return Err(Error::InvalidDigest),
        };
        if encoded.len() != expected_len
            || !encoded
                .chars()
                .all(|c| matches!(c, '0'..='9' | 'a'..='f'))
        {
            return Err(Error::InvalidDigest);
        }
        Ok(Digest {
            algorithm: algorithm.to_owned(),
            encoded: encoded.to_owned(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex part of the digest
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A parsed image reference.
///
/// At least one of `tag` and `digest` is present. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl Image {
    /// Parse `registry/repository[:tag][@digest]`.
    ///
    /// References without a digest are rejected unless `allow_tag_only` is
    /// set. The registry component must be a hostname, optionally with a
    /// port.
    pub fn parse(reference: &str, allow_tag_only: bool) -> Result<Self> {
        let invalid = || Error::InvalidReference(reference.to_owned());

        let (remainder, digest) = match reference.split_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::parse(digest)?)),
            None => (reference, None),
        };
        let Some((registry, path)) = remainder.split_once('/') else {
            return Err(invalid());
        };
        if registry.is_empty() || path.is_empty() {
            return Err(invalid());
        }
        // Fully qualified references only; a bare path component such as
        // `library/ubuntu` has no registry to mirror from.
        if !registry.contains('.') && !registry.contains(':') && registry != "localhost" {
            return Err(invalid());
        }
        let (repository, tag) = match path.split_once(':') {
            Some((repository, tag)) => {
                if tag.is_empty() {
                    return Err(invalid());
                }
                (repository, Some(tag.to_owned()))
            }
            None => (path, None),
        };
        if repository.is_empty() {
            return Err(invalid());
        }
        if digest.is_none() && tag.is_none() {
            return Err(invalid());
        }
        if digest.is_none() && !allow_tag_only {
            return Err(invalid());
        }
        Ok(Image {
            registry: registry.to_owned(),
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }

    /// True iff the tag is the literal `latest`.
    pub fn is_latest_tag(&self) -> bool {
        self.tag.as_deref() == Some("latest")
    }

    /// The fully qualified tag key, when a tag is present.
    pub fn tag_name(&self) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{}/{}:{}", self.registry, self.repository, tag))
    }

    /// The distribution path for this image's manifest resource.
    pub fn distribution_path(&self) -> DistributionPath {
        DistributionPath {
            kind: DistributionKind::Manifest,
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            digest: self.digest.clone(),
            tag: self.tag.clone(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// The resource kind a distribution path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionKind {
    Blob,
    Manifest,
}

/// Canonical `/v2/` subpath for a blob or manifest.
///
/// Blobs require a digest; manifests require a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPath {
    pub kind: DistributionKind,
    pub registry: String,
    pub repository: String,
    pub digest: Option<Digest>,
    pub tag: Option<String>,
}

impl DistributionPath {
    pub fn new(
        kind: DistributionKind,
        registry: String,
        repository: String,
        digest: Option<Digest>,
        tag: Option<String>,
    ) -> Result<Self> {
        match kind {
            DistributionKind::Blob if digest.is_none() => {
                return Err(Error::InvalidReference(format!(
                    "blob reference {registry}/{repository} requires a digest"
                )));
            }
            DistributionKind::Manifest if digest.is_none() && tag.is_none() => {
                return Err(Error::InvalidReference(format!(
                    "manifest reference {registry}/{repository} requires a tag or digest"
                )));
            }
            _ => {}
        }
        Ok(DistributionPath {
            kind,
            registry,
            repository,
            digest,
            tag,
        })
    }

    /// The manifest reference component: the digest when present, else the tag.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => String::new(),
        }
    }

    /// The registry API subpath for this resource.
    pub fn url_path(&self) -> String {
        match self.kind {
            DistributionKind::Blob => format!(
                "/v2/{}/blobs/{}",
                self.repository,
                self.digest.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
            DistributionKind::Manifest => {
                format!("/v2/{}/manifests/{}", self.repository, self.reference())
            }
        }
    }

    /// The routing key: the digest key when digest-addressed, else the tag key.
    pub fn key(&self) -> String {
        match &self.digest {
            Some(digest) => digest.to_string(),
            None => format!(
                "{}/{}:{}",
                self.registry,
                self.repository,
                self.tag.as_deref().unwrap_or_default()
            ),
        }
    }
}
