//! Advertisement engine: reconciles local images with the peer index.
//!
//! A single cooperative loop multiplexes image events, subscription errors
//! and a merged tick source. Ticks trigger a full inventory sync so that
//! advertised keys are refreshed before the peer index TTL lapses. A
//! failing image never aborts the loop; the only terminal conditions are
//! cancellation and the store closing its channels.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel;
use crate::metrics::Metrics;
use crate::oci::{walk_image, EventKind, ImageEvent, Store};
use crate::routing::{Router, KEY_TTL};
use crate::{Error, Result};

/// Run the advertisement engine until cancellation or a terminal error.
pub async fn track(
    token: CancellationToken,
    store: Arc<dyn Store>,
    router: Arc<dyn Router>,
    metrics: Arc<Metrics>,
    resolve_latest_tag: bool,
) -> Result<()> {
    let (mut event_rx, mut err_rx) = store.subscribe().await?;

    // One immediate tick, then periodic ticks one minute before the key
    // TTL would lapse, merged into a single source.
    let (immediate_tx, immediate_rx) = mpsc::channel(1);
    let _ = immediate_tx.try_send(());
    drop(immediate_tx);
    let (periodic_tx, periodic_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let period = KEY_TTL - std::time::Duration::from_secs(60);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if periodic_tx.send(()).await.is_err() {
                return;
            }
        }
    });
    let mut tick_rx = channel::merge(immediate_rx, periodic_rx);
    let mut tick_open = true;

    loop {
        tokio::select! {
            // Cancellation first, then ticks and events ahead of errors.
            biased;
            _ = token.cancelled() => return Ok(()),
            tick = tick_rx.recv(), if tick_open => {
                if tick.is_none() {
                    tick_open = false;
                    continue;
                }
                info!("running scheduled image state update");
                if let Err(err) = all(store.as_ref(), router.as_ref(), &metrics, resolve_latest_tag).await {
                    error!(%err, "received errors when updating all images");
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    return Err(Error::ChannelClosed("image event channel closed"));
                };
                info!(image = %event.image, kind = ?event.kind, "received image event");
                if let Err(err) = update(store.as_ref(), router.as_ref(), &metrics, event, false, resolve_latest_tag).await {
                    error!(%err, "received error when updating image");
                }
            }
            err = err_rx.recv() => {
                let Some(err) = err else {
                    return Err(Error::ChannelClosed("image error channel closed"));
                };
                error!(%err, "event channel error");
            }
        }
    }
}

/// Full inventory sync: rebuild the advertised keys and counters from the
/// authoritative image list. Per-image failures are collected and joined;
/// the caller logs and continues.
async fn all(
    store: &dyn Store,
    router: &dyn Router,
    metrics: &Metrics,
    resolve_latest_tag: bool,
) -> Result<()> {
    let images = store.list_images().await?;

    metrics.advertised_keys.reset();
    metrics.advertised_images.reset();
    metrics.advertised_image_tags.reset();
    metrics.advertised_image_digests.reset();

    let mut errs = Vec::new();
    let mut seen_digests = HashSet::new();
    for image in images {
        // Tag aliases share a digest; walk it only once per sync.
        let skip_digests = image
            .digest
            .as_ref()
            .is_some_and(|digest| seen_digests.contains(&digest.to_string()));
        let event = ImageEvent {
            image: image.clone(),
            kind: EventKind::Update,
        };
        debug!(image = %event.image, "sync image event");
        let key_total = match update(
            store,
            router,
            metrics,
            event,
            skip_digests,
            resolve_latest_tag,
        )
        .await
        {
            Ok(total) => total,
            Err(err) => {
                errs.push(err);
                continue;
            }
        };
        if let Some(digest) = &image.digest {
            seen_digests.insert(digest.to_string());
        }
        metrics.advertised_keys.add(&image.registry, key_total as i64);
        metrics.advertised_images.inc(&image.registry);
        if image.tag.is_none() {
            metrics.advertised_image_digests.inc(&image.registry);
        } else {
            metrics.advertised_image_tags.inc(&image.registry);
        }
    }
    Error::join(errs)
}

/// Advertise the keys for one image event. Returns the number of keys
/// advertised.
async fn update(
    store: &dyn Store,
    router: &dyn Router,
    metrics: &Metrics,
    event: ImageEvent,
    skip_digests: bool,
    resolve_latest_tag: bool,
) -> Result<usize> {
    let image = &event.image;
    let mut keys = Vec::new();
    // Skip the tag key exactly when the tag is `latest` and the policy
    // forbids resolving it.
    if resolve_latest_tag || !image.is_latest_tag() {
        if let Some(tag_name) = image.tag_name() {
            keys.push(tag_name);
        }
    }
    if event.kind == EventKind::Delete {
        // We don't know how many digest keys belonged to the deleted image;
        // the full list sync in all() settles that. The peer index has no
        // way to stop providing a key, records lapse when their TTL expires.
        metrics.advertised_images.sub(&image.registry, 1);
        return Ok(0);
    }
    if !skip_digests {
        let digests = walk_image(store, image).await.map_err(|err| Error::WalkImage {
            image: image.to_string(),
            source: Box::new(err),
        })?;
        keys.extend(digests);
    }
    router.advertise(&keys).await.map_err(|err| Error::Advertise {
        image: image.to_string(),
        source: Box::new(err),
    })?;
    if event.kind == EventKind::Create {
        // Unique digest key counts are only known to the full list sync;
        // count the image itself here.
        metrics.advertised_images.inc(&image.registry);
        if image.tag.is_none() {
            metrics.advertised_image_digests.inc(&image.registry);
        } else {
            metrics.advertised_image_tags.inc(&image.registry);
        }
    }
    Ok(keys.len())
}
