//! Coverage of executable locations, read off the hit counters.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tempo_types::ast::Model;

/// Hits of one executable location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageEntry {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub hits: u64,
}

/// Coverage summary of a whole model.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Coverage {
    pub entries: Vec<CoverageEntry>,
    pub covered: usize,
    pub total: usize,
}

impl Coverage {
    /// Every executable statement and expression location, once each, in
    /// file/line/column order.
    pub fn collect(model: &Model) -> Self {
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        model.walk(&mut |node| {
            let loc = node.location();
            if !loc.executable {
                return;
            }
            let key = (loc.file.to_string(), loc.span.start_line, loc.span.start_col);
            if seen.insert(key.clone()) {
                entries.push(CoverageEntry {
                    file: key.0,
                    line: key.1,
                    column: key.2,
                    hits: loc.hit_count(),
                });
            }
        });
        entries.sort_by(|a, b| (&a.file, a.line, a.column).cmp(&(&b.file, b.line, b.column)));
        let covered = entries.iter().filter(|e| e.hits > 0).count();
        Self {
            total: entries.len(),
            covered,
            entries,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.covered as f64 * 100.0 / self.total as f64
    }

    /// Locations never reached.
    pub fn missed(&self) -> impl Iterator<Item = &CoverageEntry> {
        self.entries.iter().filter(|e| e.hits == 0)
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in self.missed() {
            writeln!(f, "  not covered: {}:{}:{}", e.file, e.line, e.column)?;
        }
        writeln!(
            f,
            "{} of {} locations covered ({:.1}%)",
            self.covered,
            self.total,
            self.percent()
        )
    }
}
