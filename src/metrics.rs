//! Engine metrics and tracing spans.
//!
//! With the `metrics` feature, [`METRICS`] records outcomes and timings through an
//! OpenTelemetry meter backed by a Prometheus registry. With the `tracing` feature,
//! [`tracing_helpers`] provides the spans the engine enters around its phases.

#[cfg(feature = "metrics")]
pub use self::prometheus_metrics::{MigrationMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<MigrationMetrics> = Lazy::new(MigrationMetrics::init);

    pub struct MigrationMetrics {
        registry: Registry,
        // Held so the reader stays registered for the life of the process
        _provider: SdkMeterProvider,
        pub migrations_applied: Counter<u64>,
        pub migrations_skipped: Counter<u64>,
        pub migration_failures: Counter<u64>,
        pub lock_wait: Histogram<f64>,
        pub script_duration: Histogram<f64>,
    }

    impl MigrationMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
                Err(e) => {
                    log::warn!(
                        "prometheus exporter unavailable, metrics will not be exported: {e}"
                    );
                    SdkMeterProvider::builder().build()
                }
            };
            let meter = provider.meter("tideline");

            let migrations_applied = meter
                .u64_counter("tideline_migrations_applied_total")
                .with_description("Migration scripts executed successfully")
                .build();
            let migrations_skipped = meter
                .u64_counter("tideline_migrations_skipped_total")
                .with_description("Migrations skipped as already applied or by directive")
                .build();
            let migration_failures = meter
                .u64_counter("tideline_migration_failures_total")
                .with_description("Migration scripts that failed to execute")
                .build();
            let lock_wait = meter
                .f64_histogram("tideline_lock_wait_seconds")
                .with_description("Time spent waiting for the migration lock")
                .build();
            let script_duration = meter
                .f64_histogram("tideline_script_duration_seconds")
                .with_description("Duration of migration script execution")
                .build();

            Self {
                registry,
                _provider: provider,
                migrations_applied,
                migrations_skipped,
                migration_failures,
                lock_wait,
                script_duration,
            }
        }

        pub fn record_applied(&self, namespace: &str, elapsed: Duration) {
            let attrs = [KeyValue::new("namespace", namespace.to_string())];
            self.migrations_applied.add(1, &attrs);
            self.script_duration.record(elapsed.as_secs_f64(), &attrs);
        }

        pub fn record_skipped(&self, namespace: &str) {
            self.migrations_skipped
                .add(1, &[KeyValue::new("namespace", namespace.to_string())]);
        }

        pub fn record_failure(&self, namespace: &str) {
            self.migration_failures
                .add(1, &[KeyValue::new("namespace", namespace.to_string())]);
        }

        pub fn observe_lock_wait(&self, waited: Duration) {
            self.lock_wait.record(waited.as_secs_f64(), &[]);
        }

        /// Prometheus text exposition of everything recorded so far.
        pub fn render(&self) -> String {
            TextEncoder::new()
                .encode_to_string(&self.registry.gather())
                .unwrap_or_else(|e| format!("# metrics encoding failed: {e}\n"))
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn connect_span() -> Span {
        info_span!("tideline.connect")
    }

    pub fn execute_query_span(query: &str) -> Span {
        // Scripts can be large; the head is enough to identify them
        let head: String = query.trim().chars().take(64).collect();
        info_span!("tideline.execute_script", sql = %head)
    }

    pub fn lock_span() -> Span {
        info_span!("tideline.lock")
    }

    pub fn run_migration_span(namespace: &str, level: i64) -> Span {
        info_span!("tideline.run_migration", namespace = %namespace, level)
    }
}
