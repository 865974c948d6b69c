//! OCI content: references, descriptors, the store seam and the mirror
//! fetch client.

mod client;
mod descriptor;
mod image;
mod store;

pub use client::{
    AuthChallenge, Client, FetchOptions, PullResult, DEFAULT_RESOLVE_RETRIES,
    DEFAULT_RESOLVE_TIMEOUT,
};
pub use descriptor::{
    descriptor_from_header, write_descriptor_to_header, Descriptor, Manifest,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};
pub use image::{Digest, DistributionKind, DistributionPath, Image};
pub use store::{walk_image, EventKind, ImageEvent, MemoryStore, Store};
