use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Source location span.
///
/// All line/column values are 1-based for human-readable error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "line")]
    pub start_line: u32,
    #[serde(rename = "column")]
    pub start_col: u32,
    pub end_line: u32,
    #[serde(rename = "end_column")]
    pub end_col: u32,
}

impl Span {
    /// Create a new span.
    pub fn new(start_line: u32, start_col: u32, end_line: u32, end_col: u32) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// Create a zero-width span at a single position.
    pub fn point(line: u32, col: u32) -> Self {
        Self::new(line, col, line, col)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start_line, self.start_col)
    }
}

/// Cumulative execution count for one source location.
///
/// Clones share the same counter, so a tree that is cloned or shared between
/// simulated threads still reports a single total per location.
#[derive(Clone, Default)]
pub struct HitCounter(Arc<AtomicU64>);

impl HitCounter {
    pub fn hit(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Undo one hit. Saturates at zero.
    pub fn unhit(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// True when both handles count into the same total.
    pub fn shares(&self, other: &HitCounter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for HitCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HitCounter({})", self.get())
    }
}

/// A span within a named file, plus the execution bookkeeping attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub file: Arc<str>,
    #[serde(flatten)]
    pub span: Span,
    /// Whether this location counts towards coverage.
    #[serde(default = "default_executable")]
    pub executable: bool,
    #[serde(skip)]
    pub hits: HitCounter,
}

fn default_executable() -> bool {
    true
}

impl Location {
    pub fn new(file: impl Into<Arc<str>>, span: Span) -> Self {
        Self {
            file: file.into(),
            span,
            executable: true,
            hits: HitCounter::default(),
        }
    }

    /// A location that never shows up in coverage reports.
    pub fn internal(file: impl Into<Arc<str>>) -> Self {
        Self {
            executable: false,
            ..Self::new(file, Span::default())
        }
    }

    pub fn line(&self) -> u32 {
        self.span.start_line
    }

    pub fn hit(&self) -> u64 {
        self.hits.hit()
    }

    pub fn unhit(&self) {
        self.hits.unhit()
    }

    /// True when `other` is a clone of this location, hit counter included.
    pub fn shares_hits(&self, other: &Location) -> bool {
        self.hits.shares(&other.hits)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.get()
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.file == other.file && self.span == other.span
    }
}

impl Eq for Location {}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.span)
    }
}

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(1);

/// Stable identity of a statement or expression node.
///
/// Breakpoints attach to nodes through this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Allocate an id that no other node in this process uses.
    pub fn fresh() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::fresh()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_point() {
        let s = Span::point(1, 5);
        assert_eq!(s.start_line, 1);
        assert_eq!(s.start_col, 5);
        assert_eq!(s.end_line, 1);
        assert_eq!(s.end_col, 5);
    }

    #[test]
    fn test_location_display() {
        let loc = Location::new("model.rt", Span::new(3, 7, 3, 15));
        assert_eq!(format!("{loc}"), "model.rt:3:7");
    }

    #[test]
    fn test_hit_counter_shared_between_clones() {
        let loc = Location::new("model.rt", Span::point(1, 1));
        let copy = loc.clone();
        loc.hit();
        copy.hit();
        assert_eq!(loc.hit_count(), 2);
        loc.unhit();
        assert_eq!(copy.hit_count(), 1);
        assert!(loc.shares_hits(&copy));
        assert!(!loc.shares_hits(&Location::new("model.rt", Span::point(1, 1))));
    }

    #[test]
    fn test_unhit_saturates() {
        let counter = HitCounter::default();
        counter.unhit();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_location_json_uses_line_and_column() {
        let loc = Location::new("m.rt", Span::new(12, 5, 12, 22));
        let json = serde_json::to_string(&loc).unwrap();
        assert!(json.contains("\"line\":12"));
        assert!(json.contains("\"column\":5"));
        assert!(!json.contains("hits"));
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
        assert!(back.executable);
    }

    #[test]
    fn test_node_ids_are_unique() {
        let a = NodeId::fresh();
        let b = NodeId::fresh();
        assert_ne!(a, b);
    }
}
