//! Local image store seam.
//!
//! The container runtime's content store is an external collaborator; the
//! mirror consumes it through [`Store`]. [`MemoryStore`] is the in-process
//! implementation used by tests and standalone runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::oci::descriptor::Manifest;
use crate::oci::image::{Digest, Image};
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Kind of change observed in the local image inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// A change notification for one image.
///
/// Per-image order is preserved by the store; there is no ordering across
/// distinct images.
#[derive(Debug, Clone)]
pub struct ImageEvent {
    pub image: Image,
    pub kind: EventKind,
}

/// Read access to the local image inventory and its content.
#[async_trait]
pub trait Store: Send + Sync {
    /// Subscribe to image events. Both channels close on store shutdown.
    async fn subscribe(&self) -> Result<(mpsc::Receiver<ImageEvent>, mpsc::Receiver<Error>)>;

    /// List the images the local runtime currently holds.
    async fn list_images(&self) -> Result<Vec<Image>>;

    /// Read the raw content addressed by a digest.
    async fn bytes(&self, digest: &Digest) -> Result<Bytes>;
}

/// Walk an image's manifest graph and return the transitive digest keys:
/// the manifest itself, child manifests for an index, and config plus
/// layers for a leaf manifest.
pub async fn walk_image(store: &dyn Store, image: &Image) -> Result<Vec<String>> {
    let Some(digest) = &image.digest else {
        return Err(Error::InvalidReference(image.to_string()));
    };
    let mut keys = Vec::new();
    let mut queue = VecDeque::from([digest.clone()]);
    while let Some(digest) = queue.pop_front() {
        keys.push(digest.to_string());
        let data = store.bytes(&digest).await?;
        let manifest: Manifest = serde_json::from_slice(&data)?;
        if manifest.is_index() {
            for desc in manifest.referenced() {
                queue.push_back(desc.digest);
            }
        } else {
            for desc in manifest.referenced() {
                keys.push(desc.digest.to_string());
            }
        }
    }
    Ok(keys)
}

#[derive(Default)]
struct MemoryStoreInner {
    images: Vec<Image>,
    blobs: HashMap<Digest, Bytes>,
    event_subscribers: Vec<mpsc::Sender<ImageEvent>>,
    error_subscribers: Vec<mpsc::Sender<Error>>,
}

/// In-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image to the inventory without emitting an event.
    pub async fn add_image(&self, image: Image) {
        self.inner.write().await.images.push(image);
    }

    /// Store raw content under its digest.
    pub async fn add_blob(&self, digest: Digest, data: Bytes) {
        self.inner.write().await.blobs.insert(digest, data);
    }

    /// Remove an image from the inventory without emitting an event.
    pub async fn remove_image(&self, image: &Image) {
        self.inner.write().await.images.retain(|img| img != image);
    }

    /// Deliver an event to every subscriber.
    pub async fn publish_event(&self, event: ImageEvent) {
        let subscribers = self.inner.read().await.event_subscribers.clone();
        for tx in subscribers {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Deliver a subscription error to every subscriber.
    pub async fn publish_error(&self, err: Error) {
        let subscribers = self.inner.read().await.error_subscribers.clone();
        for tx in subscribers {
            let _ = tx.send(Error::other(err.to_string())).await;
        }
    }

    /// Drop all subscriber channels, closing every subscription.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        inner.event_subscribers.clear();
        inner.error_subscribers.clear();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn subscribe(&self) -> Result<(mpsc::Receiver<ImageEvent>, mpsc::Receiver<Error>)> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut inner = self.inner.write().await;
        inner.event_subscribers.push(event_tx);
        inner.error_subscribers.push(err_tx);
        Ok((event_rx, err_rx))
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        Ok(self.inner.read().await.images.clone())
    }

    async fn bytes(&self, digest: &Digest) -> Result<Bytes> {
        self.inner
            .read()
            .await
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::other(format!("content not found: {digest}")))
    }
}
