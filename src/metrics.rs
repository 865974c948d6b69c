//! In-process counters for advertisement bookkeeping.
//!
//! Counter families are keyed by the `registry` label. The advertisement
//! engine resets and rebuilds them on every full resync, so values track
//! the authoritative image list rather than accumulating forever.

use std::collections::HashMap;
use std::sync::RwLock;

/// A family of integer gauges keyed by registry.
pub struct CounterFamily {
    name: &'static str,
    help: &'static str,
    values: RwLock<HashMap<String, i64>>,
}

impl CounterFamily {
    fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, registry: &str, delta: i64) {
        let mut values = self.values.write().expect("metrics lock poisoned");
        *values.entry(registry.to_owned()).or_insert(0) += delta;
    }

    pub fn inc(&self, registry: &str) {
        self.add(registry, 1);
    }

    pub fn sub(&self, registry: &str, delta: i64) {
        self.add(registry, -delta);
    }

    pub fn reset(&self) {
        self.values.write().expect("metrics lock poisoned").clear();
    }

    pub fn get(&self, registry: &str) -> i64 {
        self.values
            .read()
            .expect("metrics lock poisoned")
            .get(registry)
            .copied()
            .unwrap_or(0)
    }

    fn render_into(&self, out: &mut String) {
        use std::fmt::Write;

        let values = self.values.read().expect("metrics lock poisoned");
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let mut entries: Vec<_> = values.iter().collect();
        entries.sort();
        for (registry, value) in entries {
            let _ = writeln!(out, "{}{{registry=\"{}\"}} {}", self.name, registry, value);
        }
    }
}

/// The advertisement counter families.
pub struct Metrics {
    pub advertised_keys: CounterFamily,
    pub advertised_images: CounterFamily,
    pub advertised_image_tags: CounterFamily,
    pub advertised_image_digests: CounterFamily,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            advertised_keys: CounterFamily::new(
                "mirrormesh_advertised_keys",
                "Keys advertised to the peer index.",
            ),
            advertised_images: CounterFamily::new(
                "mirrormesh_advertised_images",
                "Images advertised to the peer index.",
            ),
            advertised_image_tags: CounterFamily::new(
                "mirrormesh_advertised_image_tags",
                "Tagged images advertised to the peer index.",
            ),
            advertised_image_digests: CounterFamily::new(
                "mirrormesh_advertised_image_digests",
                "Digest-only images advertised to the peer index.",
            ),
        }
    }

    /// Prometheus text exposition of all families.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.advertised_keys.render_into(&mut out);
        self.advertised_images.render_into(&mut out);
        self.advertised_image_tags.render_into(&mut out);
        self.advertised_image_digests.render_into(&mut out);
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
