use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct Metrics {
    // Collections
    pub session_dispatches_total: AtomicU64,
    pub sessionless_dispatches_total: AtomicU64,
    pub slow_queries_total: AtomicU64,

    // Pipeline
    pub pipeline_executions_total: AtomicU64,
    pub pipeline_failures_total: AtomicU64,
    pub pipeline_duration_ms_total: AtomicU64,

    // Search
    pub search_indexes_created_total: AtomicU64,
    pub search_indexes_skipped_total: AtomicU64,
    pub synonym_groups_written_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            session_dispatches_total: AtomicU64::new(0),
            sessionless_dispatches_total: AtomicU64::new(0),
            slow_queries_total: AtomicU64::new(0),
            pipeline_executions_total: AtomicU64::new(0),
            pipeline_failures_total: AtomicU64::new(0),
            pipeline_duration_ms_total: AtomicU64::new(0),
            search_indexes_created_total: AtomicU64::new(0),
            search_indexes_skipped_total: AtomicU64::new(0),
            synonym_groups_written_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub fn record_dispatch(in_session: bool) {
    let m = metrics();
    if in_session {
        m.session_dispatches_total.fetch_add(1, Ordering::Relaxed);
    } else {
        m.sessionless_dispatches_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_slow_query() {
    metrics().slow_queries_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_pipeline(elapsed: Duration, ok: bool) {
    let m = metrics();
    m.pipeline_executions_total.fetch_add(1, Ordering::Relaxed);
    m.pipeline_duration_ms_total
        .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    if !ok {
        m.pipeline_failures_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_index_provisioned(created: bool) {
    let m = metrics();
    if created {
        m.search_indexes_created_total.fetch_add(1, Ordering::Relaxed);
    } else {
        m.search_indexes_skipped_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_synonym_groups(count: u64) {
    metrics()
        .synonym_groups_written_total
        .fetch_add(count, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    // collections
    let _ = writeln!(
        s,
        "# TYPE kennel_session_dispatches_total counter\nkennel_session_dispatches_total {}",
        m.session_dispatches_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE kennel_sessionless_dispatches_total counter\nkennel_sessionless_dispatches_total {}",
        m.sessionless_dispatches_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE kennel_slow_queries_total counter\nkennel_slow_queries_total {}",
        m.slow_queries_total.load(Ordering::Relaxed)
    );
    // pipeline
    let _ = writeln!(
        s,
        "# TYPE kennel_pipeline_executions_total counter\nkennel_pipeline_executions_total {}",
        m.pipeline_executions_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE kennel_pipeline_failures_total counter\nkennel_pipeline_failures_total {}",
        m.pipeline_failures_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE kennel_pipeline_duration_ms_total counter\nkennel_pipeline_duration_ms_total {}",
        m.pipeline_duration_ms_total.load(Ordering::Relaxed)
    );
    // search
    let _ = writeln!(
        s,
        "# TYPE kennel_search_indexes_created_total counter\nkennel_search_indexes_created_total {}",
        m.search_indexes_created_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE kennel_search_indexes_skipped_total counter\nkennel_search_indexes_skipped_total {}",
        m.search_indexes_skipped_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE kennel_synonym_groups_written_total counter\nkennel_synonym_groups_written_total {}",
        m.synonym_groups_written_total.load(Ordering::Relaxed)
    );
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_lists_every_counter() {
        record_dispatch(true);
        let text = render_prometheus();
        assert!(text.contains("# TYPE kennel_session_dispatches_total counter"));
        assert!(text.contains("kennel_synonym_groups_written_total"));
        assert!(metrics().session_dispatches_total.load(Ordering::Relaxed) >= 1);
    }
}
