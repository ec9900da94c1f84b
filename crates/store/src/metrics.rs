//! Store metrics

/// A dual-read store served a read from its fallback
pub fn record_dual_read_fallback(op: &'static str) {
    metrics::counter!("recall_dual_read_fallback_total", "op" => op).increment(1);
}

pub fn record_qa_cache_hit(backend: &'static str) {
    metrics::counter!("recall_qa_cache_hits_total", "backend" => backend).increment(1);
}

pub fn record_qa_cache_miss(backend: &'static str) {
    metrics::counter!("recall_qa_cache_misses_total", "backend" => backend).increment(1);
}
