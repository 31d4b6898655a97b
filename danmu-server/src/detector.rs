use std::collections::HashSet;

use danmu_common::Comment;

/// Decides whether a latest-N snapshot warrants a push.
///
/// Any id not present in the previous snapshot counts as new, regardless of
/// ordering; upstream ids are not strictly monotonic across pages.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    remembered: Option<HashSet<String>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the snapshot holds an id not seen last time, or on the
    /// first non-empty snapshot. Remembers the snapshot's ids afterwards.
    pub fn observe(&mut self, snapshot: &[Comment]) -> bool {
        if snapshot.is_empty() {
            return false;
        }
        let current: HashSet<String> = snapshot.iter().map(|c| c.id.clone()).collect();
        let changed = match &self.remembered {
            None => true,
            Some(prev) => !current.is_subset(prev),
        };
        self.remembered = Some(current);
        changed
    }

    pub fn remembered(&self) -> Option<&HashSet<String>> {
        self.remembered.as_ref()
    }
}
