use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::info;

use crate::cache::CacheKey;
use crate::metrics::Metrics;
use crate::proto;
use crate::refresh::RefreshQueue;

const CLASS_IN: u16 = 1;

/// 预热文件格式：每行 `qname qtype`，空行与 `#` 注释忽略。
/// One `qname qtype` pair per line; blank lines and `#` comments are
/// ignored, anything else malformed is counted and skipped.
pub fn parse_warmup(text: &str) -> (Vec<CacheKey>, u64) {
    let mut items = Vec::new();
    let mut invalid = 0u64;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(qname), Some(qtype), None) = (fields.next(), fields.next(), fields.next())
        else {
            invalid += 1;
            continue;
        };
        let name = qname.trim_end_matches('.');
        if name.is_empty() {
            invalid += 1;
            continue;
        }
        let Some(qtype) = proto::parse_qtype(qtype) else {
            invalid += 1;
            continue;
        };
        items.push(CacheKey::new(name, qtype, CLASS_IN));
    }

    (items, invalid)
}

/// Read the warmup file and push the first `limit` entries through the
/// normal refresh queue; dedup and bounded-queue rules apply unchanged.
pub fn enqueue_warmup_file(
    path: &Path,
    queue: &RefreshQueue,
    limit: usize,
    metrics: &Metrics,
) -> anyhow::Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read warmup file: {}", path.display()))?;
    let (items, invalid) = parse_warmup(&text);

    let loaded = if limit > 0 { items.len().min(limit) } else { 0 };
    metrics
        .refresh_warmup_loaded_total
        .fetch_add(loaded as u64, Ordering::Relaxed);
    metrics
        .refresh_warmup_invalid_lines_total
        .fetch_add(invalid, Ordering::Relaxed);

    let mut enqueued = 0;
    for key in items.into_iter().take(loaded) {
        if queue.enqueue(key) {
            enqueued += 1;
        }
    }

    info!(
        event = "warmup",
        path = %path.display(),
        loaded,
        invalid,
        enqueued,
        "warmup entries submitted"
    );
    Ok(enqueued)
}
