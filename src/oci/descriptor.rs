//! OCI content descriptors and their HTTP header transport.
//!
//! A descriptor travels on three headers: `Content-Type` carries the media
//! type, `Content-Length` the size and `Docker-Content-Digest` the digest.
//! When a `Content-Range` header is present the effective size is the total
//! component of the range.

use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::httpx::HEADER_DOCKER_DIGEST;
use crate::oci::image::Digest;
use crate::{Error, Result};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Content descriptor: media type, digest and size of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
}

/// The subset of an image manifest the mirror needs: either a list of child
/// manifests (an index) or a config plus layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<Vec<Descriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<Descriptor>>,
}

impl Manifest {
    /// Descriptors referenced by this manifest: children for an index,
    /// config and layers otherwise.
    pub fn referenced(&self) -> Vec<Descriptor> {
        if let Some(manifests) = &self.manifests {
            return manifests.clone();
        }
        let mut descs = Vec::new();
        if let Some(config) = &self.config {
            descs.push(config.clone());
        }
        if let Some(layers) = &self.layers {
            descs.extend(layers.iter().cloned());
        }
        descs
    }

    /// True when this manifest is an index of other manifests.
    pub fn is_index(&self) -> bool {
        self.manifests.is_some()
    }
}

/// Write a descriptor onto the response headers.
pub fn write_descriptor_to_header(desc: &Descriptor, header: &mut HeaderMap) {
    if let Ok(value) = HeaderValue::from_str(&desc.media_type) {
        header.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&desc.size.to_string()) {
        header.insert(CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&desc.digest.to_string()) {
        header.insert(HEADER_DOCKER_DIGEST, value);
    }
}

/// Reconstruct a descriptor from response headers.
pub fn descriptor_from_header(header: &HeaderMap) -> Result<Descriptor> {
    let media_type = header
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if media_type.is_empty() {
        return Err(Error::InvalidDescriptor(
            "content type cannot be empty".to_owned(),
        ));
    }

    let content_length = header
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_length.is_empty() {
        return Err(Error::InvalidDescriptor(
            "content length cannot be empty".to_owned(),
        ));
    }
    let mut size: i64 = content_length
        .parse()
        .map_err(|err: std::num::ParseIntError| Error::InvalidDescriptor(err.to_string()))?;

    let digest = header
        .get(HEADER_DOCKER_DIGEST)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::InvalidDigest)
        .and_then(Digest::parse)?;

    if let Some(range) = header.get(CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        size = size_from_content_range(range)?;
    }

    Ok(Descriptor {
        media_type: media_type.to_owned(),
        digest,
        size,
    })
}

// Content-Range has the form `bytes <start>-<end>/<total>`; only the total
// matters here and it has to be a real integer, not `*`.
fn size_from_content_range(value: &str) -> Result<i64> {
    let Some((unit, range)) = value.split_once(' ') else {
        return Err(Error::InvalidDescriptor(format!(
            "unexpected content range format {value}"
        )));
    };
    if unit != "bytes" {
        return Err(Error::InvalidDescriptor(format!(
            "unsupported content range unit {value}"
        )));
    }
    let format_err = || Error::InvalidDescriptor(format!("unexpected content range format {value}"));
    let (span, total) = range.split_once('/').ok_or_else(format_err)?;
    let (start, end) = span.split_once('-').ok_or_else(format_err)?;
    start.parse::<i64>().map_err(|_| format_err())?;
    end.parse::<i64>().map_err(|_| format_err())?;
    if total == "*" {
        return Err(Error::InvalidDescriptor(format!(
            "content range expected to specify size {value}"
        )));
    }
    total.parse::<i64>().map_err(|_| format_err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpx::CONTENT_TYPE_BINARY;

    const DIGEST: &str = "sha256:b6d6089ca6c395fd563c2084f5dd7bc56a2f5e6a81413558c5be0083287a77e9";
    const OTHER_DIGEST: &str =
        "sha256:9fccb471b0f2482af80f8bd7b198dfe3afedb16e683fdd30a17423a32be54d10";

    fn header(entries: &[(&str, &str)]) -> HeaderMap {
        let mut header = HeaderMap::new();
        for (name, value) in entries {
            header.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        header
    }

    #[test]
    fn test_header_round_trip() {
        let desc = Descriptor {
            media_type: "foo".to_owned(),
            digest: Digest::parse(DIGEST).unwrap(),
            size: 909,
        };
        let mut h = HeaderMap::new();
        write_descriptor_to_header(&desc, &mut h);
        assert_eq!(h.get(CONTENT_TYPE).unwrap(), "foo");
        assert_eq!(h.get(CONTENT_LENGTH).unwrap(), "909");
        assert_eq!(h.get(HEADER_DOCKER_DIGEST).unwrap(), DIGEST);

        let parsed = descriptor_from_header(&h).unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn test_header_error_matrix() {
        let cases: &[(&str, HeaderMap, &str)] = &[
            (
                "missing content type",
                header(&[("content-length", "1"), ("docker-content-digest", OTHER_DIGEST)]),
                "content type cannot be empty",
            ),
            (
                "missing content length",
                header(&[
                    ("content-type", CONTENT_TYPE_BINARY),
                    ("docker-content-digest", OTHER_DIGEST),
                ]),
                "content length cannot be empty",
            ),
            (
                "non int content length",
                header(&[
                    ("content-type", CONTENT_TYPE_BINARY),
                    ("content-length", "bar"),
                    ("docker-content-digest", OTHER_DIGEST),
                ]),
                "invalid digit found in string",
            ),
            (
                "missing digest",
                header(&[("content-type", CONTENT_TYPE_BINARY), ("content-length", "1")]),
                "invalid checksum digest format",
            ),
            (
                "invalid digest format",
                header(&[
                    ("content-type", CONTENT_TYPE_BINARY),
                    ("content-length", "1"),
                    ("docker-content-digest", "foo"),
                ]),
                "invalid checksum digest format",
            ),
            (
                "invalid content range unit",
                header(&[
                    ("content-type", CONTENT_TYPE_BINARY),
                    ("content-length", "1"),
                    ("docker-content-digest", OTHER_DIGEST),
                    ("content-range", "foo 1-3/40"),
                ]),
                "unsupported content range unit foo 1-3/40",
            ),
            (
                "invalid content range format",
                header(&[
                    ("content-type", CONTENT_TYPE_BINARY),
                    ("content-length", "1"),
                    ("docker-content-digest", OTHER_DIGEST),
                    ("content-range", "bytes 1-3 40"),
                ]),
                "unexpected content range format bytes 1-3 40",
            ),
            (
                "undefined size",
                header(&[
                    ("content-type", CONTENT_TYPE_BINARY),
                    ("content-length", "1"),
                    ("docker-content-digest", OTHER_DIGEST),
                    ("content-range", "bytes 1-3/*"),
                ]),
                "content range expected to specify size bytes 1-3/*",
            ),
        ];
        for (name, header, expected) in cases {
            let err = descriptor_from_header(header).unwrap_err();
            assert_eq!(&err.to_string(), expected, "case: {name}");
        }
    }

    #[test]
    fn test_content_range_size() {
        let h = header(&[
            ("content-type", CONTENT_TYPE_BINARY),
            ("content-length", "3"),
            ("docker-content-digest", DIGEST),
            ("content-range", "bytes 1-3/40"),
        ]);
        let desc = descriptor_from_header(&h).unwrap();
        assert_eq!(desc.size, 40);
    }

    #[test]
    fn test_manifest_referenced() {
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": DIGEST, "size": 529},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": OTHER_DIGEST, "size": 118}],
        }))
        .unwrap();
        assert!(!manifest.is_index());
        let descs = manifest.referenced();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].digest.to_string(), DIGEST);
        assert_eq!(descs[1].digest.to_string(), OTHER_DIGEST);

        let index: Manifest = serde_json::from_value(serde_json::json!({
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [{"mediaType": MEDIA_TYPE_OCI_MANIFEST, "digest": DIGEST, "size": 400}],
        }))
        .unwrap();
        assert!(index.is_index());
        assert_eq!(index.referenced().len(), 1);
    }
}
