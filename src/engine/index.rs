use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::*;

pub type OccupiedIndex = BTreeMap<NaiveDate, Vec<OccupiedRange>>;

/// Group commitments into per-date occupied ranges, each extended by
/// `buffer` minutes and sorted by start. Overlapping ranges are kept apart.
pub fn build(commitments: &[Commitment], buffer: Minutes) -> OccupiedIndex {
    let buffer = buffer.max(0);
    let mut index: OccupiedIndex = BTreeMap::new();
    for c in commitments {
        index.entry(c.date).or_default().push(OccupiedRange {
            date: c.date,
            span: Span::new(c.start, c.start + c.duration + buffer),
            label: c.label.clone(),
            source: c.source,
        });
    }
    for ranges in index.values_mut() {
        ranges.sort_by_key(|r| r.span.start);
    }
    index
}
