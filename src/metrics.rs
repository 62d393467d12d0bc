use anyhow::Result;
use opentelemetry::metrics::Counter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub fn init_provider() -> Result<Registry> {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder()
        .with_resource(opentelemetry_sdk::Resource::new(vec![
            opentelemetry::KeyValue::new("service.name", "volsnap-core"),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .with_reader(exporter)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(registry)
}

#[derive(Debug)]
pub struct SnapshotMetrics {
    pub snapshots_created: Counter<u64>,
    pub snapshots_deleted: Counter<u64>,
    pub snapshots_canceled: Counter<u64>,
    pub snapshot_failures: Counter<u64>,
}

impl Default for SnapshotMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotMetrics {
    pub fn new() -> SnapshotMetrics {
        let meter = opentelemetry::global::meter("snapshot-core");
        let snapshots_created = meter
            .u64_counter("snapshots_created")
            .with_description("number of snapshots created successfully")
            .build();
        let snapshots_deleted = meter
            .u64_counter("snapshots_deleted")
            .with_description("number of snapshots deleted successfully")
            .build();
        let snapshots_canceled = meter
            .u64_counter("snapshots_canceled")
            .with_description("number of snapshot creations canceled by users")
            .build();
        let snapshot_failures = meter
            .u64_counter("snapshot_failures")
            .with_description("number of snapshot tasks that ended in error")
            .build();
        SnapshotMetrics {
            snapshots_created,
            snapshots_deleted,
            snapshots_canceled,
            snapshot_failures,
        }
    }
}
