//! ABOUTME: Process-wide registry of labelled metric families and pull-based sources
//! ABOUTME: Supports lookup-or-create, source unregistration, and text exposition

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use eg_core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use prometheus_client::{
    collector::Collector,
    encoding::{text::encode, DescriptorEncoder},
    registry::{Metric, Registry},
};
use tracing::debug;

use crate::source::{ConstLabels, Descriptor, MetricSource, Sample};

static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Token returned by [`MetricsRegistry::register_source`], needed to unregister
#[derive(Debug, PartialEq, Eq)]
pub struct SourceRegistration {
    id: u64,
}

#[derive(Debug, Clone)]
struct SourceEntry {
    id: u64,
    labels: ConstLabels,
    source: Arc<dyn MetricSource>,
}

#[derive(Debug, Default)]
struct SourceSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<SourceEntry>>,
}

impl SourceSet {
    fn insert(&self, labels: ConstLabels, source: Arc<dyn MetricSource>) -> Result<u64> {
        let mut entries = self.entries.write();

        let clash = entries.iter().any(|entry| {
            entry.labels == labels
                && entry
                    .source
                    .describe()
                    .iter()
                    .any(|d| source.describe().iter().any(|n| n.name == d.name))
        });
        if clash {
            return Err(Error::Registration(format!(
                "a metric source with labels {} is already registered",
                format_labels(&labels)
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(SourceEntry { id, labels, source });
        Ok(id)
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    fn describes(&self, name: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|entry| entry.source.describe().iter().any(|d| d.name == name))
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Clone the entry list so collection runs without holding the lock
    fn snapshot(&self) -> Vec<SourceEntry> {
        self.entries.read().clone()
    }
}

/// Bridges registered sources into the prometheus-client scrape
#[derive(Debug)]
struct SourceCollector(Arc<SourceSet>);

impl Collector for SourceCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> std::result::Result<(), fmt::Error> {
        let collected: Vec<(ConstLabels, Vec<Sample>)> = self
            .0
            .snapshot()
            .into_iter()
            .map(|entry| {
                let samples = entry.source.collect();
                (entry.labels, samples)
            })
            .collect();

        // One family per descriptor name, spanning every source that emitted it
        let mut descriptors: Vec<Descriptor> = Vec::new();
        for sample in collected.iter().flat_map(|(_, samples)| samples.iter()) {
            if !descriptors.iter().any(|d| d.name == sample.descriptor.name) {
                descriptors.push(sample.descriptor);
            }
        }

        for descriptor in descriptors {
            let mut metric_encoder = encoder.encode_descriptor(
                descriptor.name,
                descriptor.help,
                None,
                descriptor.kind.metric_type(),
            )?;
            for (labels, samples) in &collected {
                for sample in samples
                    .iter()
                    .filter(|s| s.descriptor.name == descriptor.name)
                {
                    let family_encoder = metric_encoder.encode_family(labels)?;
                    sample.encode(family_encoder)?;
                }
            }
        }

        Ok(())
    }
}

/// Shared namespace of metric families and pull-based sources
///
/// Families registered through [`get_or_register`](Self::get_or_register) live
/// for the lifetime of the registry. Sources can come and go, which is what
/// lets a closed database handle drop its pool series.
pub struct MetricsRegistry {
    registry: Mutex<Registry>,
    families: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    sources: Arc<SourceSet>,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("families", &self.families.lock().len())
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let sources = Arc::new(SourceSet::default());
        let mut registry = Registry::default();
        registry.register_collector(Box::new(SourceCollector(Arc::clone(&sources))));

        Self {
            registry: Mutex::new(registry),
            families: Mutex::new(HashMap::new()),
            sources,
        }
    }

    /// Process-wide default instance
    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())))
    }

    /// Return the family registered under `name`, creating it with `make` on first use
    ///
    /// `help` is given without a trailing period; the exposition adds one.
    /// Counters are registered without the `_total` suffix, which the
    /// exposition appends.
    pub fn get_or_register<M, F>(&self, name: &str, help: &str, make: F) -> Result<M>
    where
        M: Metric + Clone,
        F: FnOnce() -> M,
    {
        let mut families = self.families.lock();

        if let Some(existing) = families.get(name) {
            return existing.downcast_ref::<M>().cloned().ok_or_else(|| {
                Error::Registration(format!(
                    "metric {} is already registered with a different type",
                    name
                ))
            });
        }

        if self.sources.describes(name) {
            return Err(Error::Registration(format!(
                "metric {} is already produced by a registered source",
                name
            )));
        }

        let metric = make();
        self.registry.lock().register(name, help, metric.clone());
        families.insert(name.to_string(), Box::new(metric.clone()));

        debug!(metric = %name, "Registered metric family");
        Ok(metric)
    }

    /// Register a pull-based source whose samples all carry `labels`
    ///
    /// Fails if a source with the same label set already produces one of the
    /// same series; leaving both would emit duplicate samples on every scrape.
    pub fn register_source(
        &self,
        labels: ConstLabels,
        source: Arc<dyn MetricSource>,
    ) -> Result<SourceRegistration> {
        {
            let families = self.families.lock();
            if let Some(d) = source
                .describe()
                .iter()
                .find(|d| families.contains_key(d.name))
            {
                return Err(Error::Registration(format!(
                    "metric {} is already registered as a family",
                    d.name
                )));
            }
        }

        let id = self.sources.insert(labels, source)?;
        Ok(SourceRegistration { id })
    }

    /// Remove a source; returns false if it was not registered. Never fails.
    pub fn unregister(&self, registration: &SourceRegistration) -> bool {
        self.sources.remove(registration.id)
    }

    /// Number of currently registered sources
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Scrape: encode every family and collect every source in text exposition format
    pub fn encode(&self) -> Result<String> {
        let registry = self.registry.lock();

        let mut buffer = String::new();
        encode(&mut buffer, &registry)
            .map_err(|e| Error::Metrics(format!("Failed to encode metrics: {}", e)))?;

        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn format_labels(labels: &ConstLabels) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{{{}}}", pairs.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Descriptor;
    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::{counter::Counter, family::Family, gauge::Gauge};
    use std::sync::atomic::AtomicI64;

    const DEPTH: Descriptor = Descriptor::gauge("test_queue_depth", "Items waiting.");
    const DRAINED: Descriptor = Descriptor::counter("test_queue_drained", "Items drained.");
    const DESCRIPTORS: [Descriptor; 2] = [DEPTH, DRAINED];

    #[derive(Debug, Default)]
    struct QueueSource {
        depth: AtomicI64,
    }

    impl MetricSource for QueueSource {
        fn describe(&self) -> &[Descriptor] {
            &DESCRIPTORS
        }

        fn collect(&self) -> Vec<Sample> {
            vec![
                DEPTH.sample(self.depth.load(Ordering::Relaxed) as f64),
                DRAINED.sample(7.0),
            ]
        }
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct PathLabels {
        path: String,
    }

    fn labels(queue: &str) -> ConstLabels {
        vec![("queue".to_string(), queue.to_string())]
    }

    #[test]
    fn test_get_or_register_returns_shared_family() {
        let registry = MetricsRegistry::new();
        let first: Family<PathLabels, Counter> = registry
            .get_or_register("test_hits", "Hits", Family::default)
            .unwrap();
        let second: Family<PathLabels, Counter> = registry
            .get_or_register("test_hits", "Hits", Family::default)
            .unwrap();

        let key = PathLabels {
            path: "/a".to_string(),
        };
        first.get_or_create(&key).inc();

        assert_eq!(second.get_or_create(&key).get(), 1);
        let text = registry.encode().unwrap();
        assert!(text.contains("# HELP test_hits Hits."));
        assert!(text.contains("test_hits_total{path=\"/a\"} 1"));
    }

    #[test]
    fn test_get_or_register_rejects_type_conflict() {
        let registry = MetricsRegistry::new();
        let _: Family<PathLabels, Counter> = registry
            .get_or_register("test_conflict", "Conflict", Family::default)
            .unwrap();

        let result: Result<Gauge> =
            registry.get_or_register("test_conflict", "Conflict", Gauge::default);
        assert!(matches!(result, Err(Error::Registration(_))));
    }

    #[test]
    fn test_source_collected_on_every_scrape() {
        let registry = MetricsRegistry::new();
        let source = Arc::new(QueueSource::default());
        registry
            .register_source(labels("jobs"), source.clone())
            .unwrap();

        source.depth.store(3, Ordering::Relaxed);
        let text = registry.encode().unwrap();
        assert!(text.contains("# TYPE test_queue_depth gauge"));
        assert!(text.contains("test_queue_depth{queue=\"jobs\"} 3"));
        assert!(text.contains("# TYPE test_queue_drained counter"));
        assert!(text.contains("test_queue_drained_total{queue=\"jobs\"} 7"));

        source.depth.store(5, Ordering::Relaxed);
        let text = registry.encode().unwrap();
        assert!(text.contains("test_queue_depth{queue=\"jobs\"} 5"));
    }

    #[test]
    fn test_sources_share_one_family_per_series() {
        let registry = MetricsRegistry::new();
        registry
            .register_source(labels("jobs"), Arc::new(QueueSource::default()))
            .unwrap();
        registry
            .register_source(labels("mail"), Arc::new(QueueSource::default()))
            .unwrap();

        let text = registry.encode().unwrap();
        assert_eq!(text.matches("# TYPE test_queue_depth gauge").count(), 1);
        assert!(text.contains("test_queue_depth{queue=\"jobs\"}"));
        assert!(text.contains("test_queue_depth{queue=\"mail\"}"));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let registry = MetricsRegistry::new();
        registry
            .register_source(labels("jobs"), Arc::new(QueueSource::default()))
            .unwrap();

        let result = registry.register_source(labels("jobs"), Arc::new(QueueSource::default()));
        assert!(matches!(result, Err(Error::Registration(_))));
        assert_eq!(registry.source_count(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = MetricsRegistry::new();
        let registration = registry
            .register_source(labels("jobs"), Arc::new(QueueSource::default()))
            .unwrap();

        assert!(registry.unregister(&registration));
        assert!(!registry.unregister(&registration));
        assert_eq!(registry.source_count(), 0);
        assert!(!registry.encode().unwrap().contains("test_queue_depth"));

        // Same labels can be registered again once the old source is gone
        registry
            .register_source(labels("jobs"), Arc::new(QueueSource::default()))
            .unwrap();
    }

    #[test]
    fn test_source_cannot_shadow_family() {
        let registry = MetricsRegistry::new();
        let _: Gauge = registry
            .get_or_register("test_queue_depth", "Depth", Gauge::default)
            .unwrap();

        let result = registry.register_source(labels("jobs"), Arc::new(QueueSource::default()));
        assert!(matches!(result, Err(Error::Registration(_))));
    }

    #[test]
    fn test_global_is_shared() {
        let a = MetricsRegistry::global();
        let b = MetricsRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_concurrent_register_and_scrape() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let registration = registry
                        .register_source(labels(&format!("q{}", i)), Arc::new(QueueSource::default()))
                        .unwrap();
                    registry.encode().unwrap();
                    assert!(registry.unregister(&registration));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.source_count(), 0);
    }

    #[derive(Debug)]
    struct PanickingSource;

    impl MetricSource for PanickingSource {
        fn describe(&self) -> &[Descriptor] {
            std::slice::from_ref(&DEPTH)
        }

        fn collect(&self) -> Vec<Sample> {
            panic!("stats read failed");
        }
    }

    #[test]
    fn test_scrape_recovers_after_panicking_source() {
        let registry = MetricsRegistry::new();
        let broken = registry
            .register_source(labels("broken"), Arc::new(PanickingSource))
            .unwrap();

        let scrape = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| registry.encode()));
        assert!(scrape.is_err());

        assert!(registry.unregister(&broken));
        let family: Family<PathLabels, Counter> = registry
            .get_or_register("test_after_panic", "Registered after a failed scrape", Family::default)
            .unwrap();
        family
            .get_or_create(&PathLabels {
                path: "/".to_string(),
            })
            .inc();

        let text = registry.encode().unwrap();
        assert!(text.contains("test_after_panic_total{path=\"/\"} 1"));
    }
}
