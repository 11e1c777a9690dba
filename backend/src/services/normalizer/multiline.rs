//! Multiline reassembly over a raw ingest batch.
//!
//! Four ordered methods, each consuming the entries it merges:
//!   1. `[N-M]` continuation headers (PostgreSQL via syslog)
//!   2. PID + same-second grouping (PostgreSQL log_line_prefix)
//!   3. Same-second head/fragment heuristics
//!   4. Cross-batch fragment buffer for orphans
//!
//! The buffer is process-local and bounded: 500 keys x 30 fragments,
//! 10 s TTL with lazy purge on every call, oldest-key eviction. Fragments
//! dropped by the caps are dropped silently.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use super::{RawEntry, timestamp};

const BUFFER_TTL_SECS: u64 = 10;
const MAX_BUFFER_KEYS: usize = 500;
const MAX_FRAGMENTS_PER_KEY: usize = 30;
const HEAD_ADOPTION_WINDOW_SECS: i64 = 5;
const MAX_FRAGMENTS_PER_HEAD: usize = 20;

static CONT_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\d+)-(\d+)\]\s?(?s)(.*)$").expect("static regex"));

static PG_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\.\d+\s+\S+\s+\[(\d+)\]\s+\S+@\S+\s+([A-Z]+):",
    )
    .expect("static regex")
});

static LEVEL_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(ERROR|WARN(ING)?|INFO|DEBUG|NOTICE|TRACE|FATAL|PANIC|CRIT(ICAL)?)\b")
        .expect("static regex")
});

static TIMESTAMP_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").expect("static regex"));

static KEY_VALUE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.-]+:\s+\S").expect("static regex"));

const PG_HEAD_LEVELS: &[&str] = &["ERROR", "WARNING", "LOG", "FATAL", "PANIC"];
const PG_CONT_LEVELS: &[&str] = &["DETAIL", "HINT", "CONTEXT", "STATEMENT", "QUERY"];

struct BufferedFragment {
    entry: RawEntry,
    message: String,
    event_ts: DateTime<Utc>,
    buffered_at: Instant,
}

#[derive(Default)]
struct FragmentBuffer {
    slots: HashMap<(String, String), Vec<BufferedFragment>>,
    /// Key insertion order for oldest-key eviction
    order: Vec<(String, String)>,
}

/// Batch-level multiline reassembler with the cross-batch orphan buffer.
/// One instance lives for the process; ingest handlers may run concurrently,
/// so the buffer is mutex-guarded.
pub struct MultilineReassembler {
    buffer: Mutex<FragmentBuffer>,
}

impl Default for MultilineReassembler {
    fn default() -> Self {
        Self::new()
    }
}

struct Item {
    entry: RawEntry,
    host: String,
    program: String,
    event_ts: DateTime<Utc>,
    consumed: bool,
}

impl Item {
    fn message(&self) -> String {
        self.entry
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    fn set_message(&mut self, message: String) {
        self.entry.insert("message".to_string(), serde_json::Value::String(message));
    }
}

impl MultilineReassembler {
    pub fn new() -> Self {
        Self { buffer: Mutex::new(FragmentBuffer::default()) }
    }

    /// Reassemble one batch. Returns the surviving entries in batch order,
    /// followed by any buffered fragments whose TTL expired.
    pub fn reassemble(&self, entries: Vec<RawEntry>, now: DateTime<Utc>) -> Vec<RawEntry> {
        let mut items: Vec<Item> = entries
            .into_iter()
            .map(|entry| {
                let host = str_field(&entry, "host");
                let program = str_field(&entry, "program");
                let event_ts = timestamp::resolve(&entry, now);
                Item { entry, host, program, event_ts, consumed: false }
            })
            .collect();

        merge_continuation_headers(&mut items);
        merge_pg_pid_groups(&mut items);
        let orphans = merge_same_second_fragments(&mut items);

        let mut released = Vec::new();
        {
            let mut buffer = self.buffer.lock().expect("fragment buffer poisoned");
            buffer.purge_expired(&mut released);
            buffer.adopt_into_heads(&mut items);
            buffer.park(orphans, &mut items);
        }

        let mut out: Vec<RawEntry> = items
            .into_iter()
            .filter(|i| !i.consumed)
            .map(|i| i.entry)
            .collect();
        out.extend(released);
        out
    }
}

fn str_field(entry: &RawEntry, key: &str) -> String {
    entry
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Decode the syslog escapes PostgreSQL uses in continuation lines.
fn decode_syslog_escapes(s: &str) -> String {
    s.replace("#011", "\t").replace("#012", "\n")
}

// ----------------------------------------------------------------------
// Method 1: [N-M] continuation headers
// ----------------------------------------------------------------------

fn merge_continuation_headers(items: &mut [Item]) {
    // (host, program, N) -> [(M, index, rest)]
    let mut groups: HashMap<(String, String, u64), Vec<(u64, usize, String)>> = HashMap::new();

    for (idx, item) in items.iter().enumerate() {
        if item.consumed {
            continue;
        }
        let message = item.message();
        if let Some(caps) = CONT_HEADER.captures(&message) {
            let n: u64 = caps[1].parse().unwrap_or(0);
            let m: u64 = caps[2].parse().unwrap_or(0);
            let rest = caps[3].to_string();
            groups
                .entry((item.host.clone(), item.program.clone(), n))
                .or_default()
                .push((m, idx, rest));
        }
    }

    for (_key, mut parts) in groups {
        if parts.len() < 2 {
            continue;
        }
        parts.sort_by_key(|(m, _, _)| *m);

        let head_idx = if parts[0].0 == 1 {
            parts[0].1
        } else {
            // Orphan continuation group: merge at the earliest position
            parts.iter().map(|(_, idx, _)| *idx).min().expect("non-empty group")
        };

        let merged = parts
            .iter()
            .map(|(_, _, rest)| decode_syslog_escapes(rest))
            .collect::<Vec<_>>()
            .join("\n");

        for (_, idx, _) in &parts {
            items[*idx].consumed = *idx != head_idx;
        }
        items[head_idx].set_message(merged);
    }
}

// ----------------------------------------------------------------------
// Method 2: PID + same-second grouping (PostgreSQL log_line_prefix)
// ----------------------------------------------------------------------

fn merge_pg_pid_groups(items: &mut [Item]) {
    // (host, program, pid, second) -> [(index, level)]
    let mut groups: HashMap<(String, String, String, String), Vec<(usize, String)>> =
        HashMap::new();

    for (idx, item) in items.iter().enumerate() {
        if item.consumed {
            continue;
        }
        let message = item.message();
        if let Some(caps) = PG_PREFIX.captures(&message) {
            let second = caps[1].to_string();
            let pid = caps[2].to_string();
            let level = caps[3].to_string();
            groups
                .entry((item.host.clone(), item.program.clone(), pid, second))
                .or_default()
                .push((idx, level));
        }
    }

    for (_key, members) in groups {
        // Only the first head of the group absorbs.
        let Some(&(head_idx, _)) = members
            .iter()
            .find(|(_, level)| PG_HEAD_LEVELS.contains(&level.as_str()))
        else {
            continue;
        };

        // Continuations attach in the fixed level order, original order
        // within the same level.
        let mut continuations: Vec<(usize, usize)> = members
            .iter()
            .filter_map(|(idx, level)| {
                PG_CONT_LEVELS
                    .iter()
                    .position(|l| l == level)
                    .map(|rank| (rank, *idx))
            })
            .collect();
        if continuations.is_empty() {
            continue;
        }
        continuations.sort();

        let mut merged = items[head_idx].message();
        for (_, idx) in continuations {
            merged.push('\n');
            merged.push_str(&items[idx].message());
            items[idx].consumed = true;
        }
        items[head_idx].set_message(merged);
    }
}

// ----------------------------------------------------------------------
// Method 3: same-second head/fragment heuristics
// ----------------------------------------------------------------------

fn looks_like_head(message: &str) -> bool {
    LEVEL_HEAD.is_match(message) || TIMESTAMP_HEAD.is_match(message)
}

fn looks_like_fragment(message: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let first = message.chars().next().expect("non-empty");
    if first == ' ' || first == '\t' {
        return true;
    }
    if matches!(first, '}' | ')' | ']' | ':') {
        return true;
    }
    if message.starts_with("at ") {
        return true;
    }
    let trimmed = message.trim_end();
    if KEY_VALUE_LINE.is_match(message) && trimmed.len() < 80 {
        return true;
    }
    if trimmed.ends_with(',') && trimmed.len() < 120 {
        return true;
    }
    matches!(first, '-' | '+' | '|' | '>' | '*')
}

/// Merge fragments into the head preceding them within the same
/// (host, program, second) group. Returns the indices of orphan fragments
/// (groups without any head) for the cross-batch buffer.
fn merge_same_second_fragments(items: &mut [Item]) -> Vec<usize> {
    let mut groups: HashMap<(String, String, i64), Vec<usize>> = HashMap::new();

    for (idx, item) in items.iter().enumerate() {
        if item.consumed {
            continue;
        }
        groups
            .entry((item.host.clone(), item.program.clone(), item.event_ts.timestamp()))
            .or_default()
            .push(idx);
    }

    let mut orphans = Vec::new();

    for (_key, member_indices) in groups {
        let classified: Vec<(usize, bool)> = member_indices
            .iter()
            .map(|&idx| {
                let message = items[idx].message();
                // Head wins when both heuristics fire (an ERROR line ending
                // in a comma is still a head).
                let is_fragment = !looks_like_head(&message) && looks_like_fragment(&message);
                (idx, is_fragment)
            })
            .collect();

        let has_head = classified.iter().any(|(_, frag)| !frag);
        let has_fragment = classified.iter().any(|(_, frag)| *frag);
        if !has_fragment {
            continue;
        }
        if !has_head {
            orphans.extend(classified.iter().map(|(idx, _)| *idx));
            continue;
        }

        // Fragments before the first head are prepended to it.
        let first_head = classified
            .iter()
            .find(|(_, frag)| !frag)
            .map(|(idx, _)| *idx)
            .expect("group has a head");
        let mut leading: Vec<usize> = Vec::new();

        let mut current_head: Option<usize> = None;
        let mut absorbed_by_current = 0usize;
        for (idx, is_fragment) in classified {
            if !is_fragment {
                current_head = Some(idx);
                absorbed_by_current = 0;
                continue;
            }
            match current_head {
                None => leading.push(idx),
                Some(head_idx) => {
                    if absorbed_by_current >= MAX_FRAGMENTS_PER_HEAD {
                        continue;
                    }
                    let mut merged = items[head_idx].message();
                    merged.push('\n');
                    merged.push_str(&items[idx].message());
                    items[head_idx].set_message(merged);
                    items[idx].consumed = true;
                    absorbed_by_current += 1;
                },
            }
        }

        if !leading.is_empty() {
            let mut prefix = String::new();
            for idx in &leading {
                prefix.push_str(&items[*idx].message());
                prefix.push('\n');
                items[*idx].consumed = true;
            }
            let merged = format!("{}{}", prefix, items[first_head].message());
            items[first_head].set_message(merged);
        }
    }

    orphans
}

// ----------------------------------------------------------------------
// Method 4: cross-batch buffer
// ----------------------------------------------------------------------

impl FragmentBuffer {
    fn purge_expired(&mut self, released: &mut Vec<RawEntry>) {
        let ttl = std::time::Duration::from_secs(BUFFER_TTL_SECS);
        let mut emptied: Vec<(String, String)> = Vec::new();

        for (key, fragments) in self.slots.iter_mut() {
            let mut kept = Vec::new();
            for fragment in fragments.drain(..) {
                if fragment.buffered_at.elapsed() >= ttl {
                    released.push(fragment.entry);
                } else {
                    kept.push(fragment);
                }
            }
            *fragments = kept;
            if fragments.is_empty() {
                emptied.push(key.clone());
            }
        }

        for key in emptied {
            self.slots.remove(&key);
            self.order.retain(|k| *k != key);
        }
    }

    /// Give buffered fragments to a head from the current batch with the
    /// same (host, program) key and an event timestamp within the adoption
    /// window.
    fn adopt_into_heads(&mut self, items: &mut [Item]) {
        for item in items.iter_mut() {
            if item.consumed {
                continue;
            }
            let message = item.message();
            if !looks_like_head(&message) {
                continue;
            }
            let key = (item.host.clone(), item.program.clone());
            let Some(fragments) = self.slots.get_mut(&key) else {
                continue;
            };

            let mut merged = message;
            let mut adopted = false;
            fragments.retain(|fragment| {
                let delta = (fragment.event_ts - item.event_ts).num_seconds().abs();
                if delta <= HEAD_ADOPTION_WINDOW_SECS {
                    merged.push('\n');
                    merged.push_str(&fragment.message);
                    adopted = true;
                    false
                } else {
                    true
                }
            });

            if adopted {
                item.set_message(merged);
            }
            if fragments.is_empty() {
                self.slots.remove(&key);
                self.order.retain(|k| *k != key);
            }
        }
    }

    fn park(&mut self, orphan_indices: Vec<usize>, items: &mut [Item]) {
        for idx in orphan_indices {
            let item = &mut items[idx];
            if item.consumed {
                continue;
            }
            let key = (item.host.clone(), item.program.clone());

            if !self.slots.contains_key(&key) {
                if self.slots.len() >= MAX_BUFFER_KEYS {
                    // FIFO eviction; the dropped key's fragments are lost.
                    if !self.order.is_empty() {
                        let oldest = self.order.remove(0);
                        self.slots.remove(&oldest);
                    }
                }
                self.order.push(key.clone());
                self.slots.insert(key.clone(), Vec::new());
            }

            let fragments = self.slots.get_mut(&key).expect("slot just ensured");
            if fragments.len() >= MAX_FRAGMENTS_PER_KEY {
                item.consumed = true;
                continue;
            }

            let message = item.message();
            fragments.push(BufferedFragment {
                entry: item.entry.clone(),
                message,
                event_ts: item.event_ts,
                buffered_at: Instant::now(),
            });
            item.consumed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host: &str, program: &str, message: &str) -> RawEntry {
        serde_json::json!({
            "host": host,
            "program": program,
            "message": message,
            "timestamp": "2024-06-01T12:00:00Z",
        })
        .as_object()
        .expect("object")
        .clone()
    }

    fn messages(entries: &[RawEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.get("message").and_then(|v| v.as_str()).unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_continuation_header_merge() {
        let reassembler = MultilineReassembler::new();
        let batch = vec![
            entry("db", "postgres", "[5-1] first"),
            entry("db", "postgres", "[5-2] #011second"),
            entry("db", "postgres", "[5-3] third"),
        ];
        let out = reassembler.reassemble(batch, Utc::now());
        assert_eq!(out.len(), 1);
        assert_eq!(messages(&out)[0], "first\n\tsecond\nthird");
    }

    #[test]
    fn test_continuation_groups_are_keyed_by_host() {
        let reassembler = MultilineReassembler::new();
        let batch = vec![
            entry("db1", "postgres", "[5-1] alpha"),
            entry("db2", "postgres", "[5-1] beta"),
            entry("db1", "postgres", "[5-2] gamma"),
        ];
        let out = reassembler.reassemble(batch, Utc::now());
        assert_eq!(out.len(), 2);
        let msgs = messages(&out);
        assert!(msgs.contains(&"alpha\ngamma".to_string()));
        // A group of one is left alone, marker included.
        assert!(msgs.contains(&"[5-1] beta".to_string()));
    }

    #[test]
    fn test_orphan_continuation_group_merges_without_head() {
        let reassembler = MultilineReassembler::new();
        let batch = vec![
            entry("db", "postgres", "[7-2] tail a"),
            entry("db", "postgres", "[7-3] tail b"),
        ];
        let out = reassembler.reassemble(batch, Utc::now());
        assert_eq!(out.len(), 1);
        assert_eq!(messages(&out)[0], "tail a\ntail b");
    }

    #[test]
    fn test_pg_pid_group_merge() {
        let reassembler = MultilineReassembler::new();
        let batch = vec![
            entry(
                "db",
                "postgres",
                "2024-06-01 12:00:00.123 UTC [4242] app@orders ERROR: deadlock detected",
            ),
            entry(
                "db",
                "postgres",
                "2024-06-01 12:00:00.124 UTC [4242] app@orders DETAIL: Process 4242 waits",
            ),
            entry(
                "db",
                "postgres",
                "2024-06-01 12:00:00.125 UTC [4242] app@orders STATEMENT: UPDATE orders",
            ),
        ];
        let out = reassembler.reassemble(batch, Utc::now());
        assert_eq!(out.len(), 1);
        let merged = &messages(&out)[0];
        assert!(merged.contains("ERROR: deadlock detected"));
        assert!(merged.contains("DETAIL"));
        assert!(merged.contains("STATEMENT"));
        // Head first, continuations after
        assert!(merged.find("ERROR").unwrap() < merged.find("DETAIL").unwrap());
    }

    #[test]
    fn test_same_second_fragment_merge() {
        let reassembler = MultilineReassembler::new();
        let batch = vec![
            entry("app", "java", "ERROR Unhandled exception in request"),
            entry("app", "java", "at com.example.Handler.run(Handler.java:42)"),
            entry("app", "java", "at com.example.Main.main(Main.java:7)"),
        ];
        let out = reassembler.reassemble(batch, Utc::now());
        assert_eq!(out.len(), 1);
        let merged = &messages(&out)[0];
        assert!(merged.starts_with("ERROR Unhandled exception"));
        assert!(merged.contains("Handler.java:42"));
    }

    #[test]
    fn test_fragments_without_head_are_buffered_not_emitted() {
        let reassembler = MultilineReassembler::new();
        let batch = vec![entry("app", "java", "at com.example.Handler.run(Handler.java:42)")];
        let out = reassembler.reassemble(batch, Utc::now());
        assert!(out.is_empty());

        // A head arriving in the next batch within the window adopts them.
        let batch = vec![entry("app", "java", "ERROR Unhandled exception in request")];
        let out = reassembler.reassemble(batch, Utc::now());
        assert_eq!(out.len(), 1);
        assert!(messages(&out)[0].contains("Handler.java:42"));
    }

    #[test]
    fn test_unrelated_entries_pass_through() {
        let reassembler = MultilineReassembler::new();
        let batch = vec![
            entry("web", "nginx", "GET /healthz 200"),
            entry("db", "postgres", "checkpoint complete"),
        ];
        let out = reassembler.reassemble(batch, Utc::now());
        assert_eq!(out.len(), 2);
    }
}
