use std::collections::BTreeSet;

/// Reserved delimiter joining sorted unit ids into `EncodedResumeInfo`.
pub const CURSOR_DELIMITER: char = '\t';

/// The sorted, deduplicated set of in-flight unit identifiers at the moment
/// progress was snapshotted (spec §4.7).
#[derive(Debug, Default, Clone)]
pub struct ResumeCursor {
    ids: BTreeSet<String>,
}

impl ResumeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a unit id into the in-flight set (called on `StartUnitChunking`).
    pub fn insert(&mut self, id: impl Into<String>) {
        self.ids.insert(id.into());
    }

    /// Remove a unit id (called on `EndUnitChunking`).
    pub fn remove(&mut self, id: &str) {
        self.ids.remove(id);
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Sorted ids joined by the reserved delimiter. The empty set encodes to
    /// the empty string.
    pub fn encode(&self) -> String {
        self.ids.iter().cloned().collect::<Vec<_>>().join(&CURSOR_DELIMITER.to_string())
    }

    /// Decoding splits on the delimiter; the empty string decodes to the
    /// empty list.
    pub fn decode(encoded: &str) -> Vec<String> {
        if encoded.is_empty() {
            Vec::new()
        } else {
            encoded.split(CURSOR_DELIMITER).map(str::to_string).collect()
        }
    }

    /// Resume filter (spec §4.7): intersects `all_ids` (sorted) with the
    /// decoded cursor, keeping any id that either appears in the cursor or
    /// sorts strictly after the cursor's maximum entry. Returns the filtered
    /// list and the count of ids excluded ahead of it, used to keep
    /// percent-complete truthful across a resume.
    pub fn filter_resume(all_ids: &[String], encoded: &str) -> (Vec<String>, usize) {
        let cursor_ids = Self::decode(encoded);
        if cursor_ids.is_empty() {
            return (all_ids.to_vec(), 0);
        }

        let cursor_set: BTreeSet<&str> = cursor_ids.iter().map(String::as_str).collect();
        let max_cursor = cursor_ids.iter().max().cloned();

        let mut kept = Vec::new();
        let mut excluded = 0usize;
        for id in all_ids {
            let keep = cursor_set.contains(id.as_str())
                || max_cursor.as_deref().is_some_and(|max| id.as_str() > max);
            if keep {
                kept.push(id.clone());
            } else {
                excluded += 1;
            }
        }
        (kept, excluded)
    }
}
