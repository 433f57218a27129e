/// Marker separating an attempt id from the store-assigned sequence suffix.
pub const LOCK_MARKER: &str = "__lock__";

/// Extract the sequence number from a contender name such as
/// `3f2a..__lock__0000000007`. Names without the marker or with a
/// non-numeric suffix are not contenders.
pub fn sequence_of(name: &str) -> Option<u64> {
    let (_, suffix) = name.rsplit_once(LOCK_MARKER)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Attempt id a contender name was created under.
pub fn attempt_of(name: &str) -> Option<&str> {
    name.rsplit_once(LOCK_MARKER).map(|(attempt, _)| attempt)
}

/// Contender names sorted by sequence number, lowest (the holder) first.
pub fn queue_order<S: AsRef<str>>(snapshot: &[S]) -> Vec<&str> {
    let mut contenders: Vec<(u64, &str)> = snapshot
        .iter()
        .filter_map(|entry| {
            let name: &str = entry.as_ref();
            sequence_of(name).map(|seq| (seq, name))
        })
        .collect();
    contenders.sort_unstable();
    contenders.into_iter().map(|(_, name)| name).collect()
}

/// Where a contender stands in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePosition {
    /// Lowest sequence number among the current siblings.
    Holder,
    /// Waiting at `rank` behind `predecessor`, the only node worth watching.
    Waiting { rank: usize, predecessor: String },
    /// Own node is not among the siblings.
    Missing,
}

impl QueuePosition {
    pub fn is_holder(&self) -> bool {
        matches!(self, QueuePosition::Holder)
    }

    pub fn watch_target(&self) -> Option<&str> {
        match self {
            QueuePosition::Waiting { predecessor, .. } => Some(predecessor),
            _ => None,
        }
    }
}

/// Resolve `own_name` against a snapshot taken after it was created.
///
/// Only the immediate predecessor is reported, so a deletion wakes at most
/// one waiter.
pub fn resolve<S: AsRef<str>>(own_name: &str, snapshot: &[S]) -> QueuePosition {
    let order = queue_order(snapshot);
    match order.iter().position(|name| *name == own_name) {
        Some(0) => QueuePosition::Holder,
        Some(rank) => QueuePosition::Waiting {
            rank,
            predecessor: order[rank - 1].to_string(),
        },
        None => QueuePosition::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(id: &str, seq: u64) -> String {
        format!("{}{}{:010}", id, LOCK_MARKER, seq)
    }

    #[test]
    fn test_sequence_parsing() {
        assert_eq!(sequence_of(&name("abc", 42)), Some(42));
        assert_eq!(sequence_of("abc__lock__"), None);
        assert_eq!(sequence_of("abc__lock__12x"), None);
        assert_eq!(attempt_of(&name("abc", 3)), Some("abc"));
        assert_eq!(sequence_of("config"), None);
    }

    #[test]
    fn test_sorts_by_sequence_not_by_name() {
        // Attempt ids are random, so lexical order says nothing.
        let snapshot = vec![name("zzz", 1), name("aaa", 3), name("mmm", 2)];
        assert_eq!(
            queue_order(&snapshot),
            vec![snapshot[0].as_str(), snapshot[2].as_str(), snapshot[1].as_str()]
        );
    }

    #[test]
    fn test_first_contender_holds() {
        let snapshot = vec![name("b", 8), name("a", 7)];
        assert_eq!(resolve(&name("a", 7), &snapshot), QueuePosition::Holder);
    }

    #[test]
    fn test_waiter_watches_immediate_predecessor() {
        let snapshot = vec![name("a", 1), name("b", 2), name("c", 3), name("d", 4)];

        let position = resolve(&name("c", 3), &snapshot);
        assert_eq!(
            position,
            QueuePosition::Waiting {
                rank: 2,
                predecessor: name("b", 2),
            }
        );
        assert_eq!(position.watch_target(), Some(name("b", 2).as_str()));
    }

    #[test]
    fn test_gap_in_sequence_still_picks_predecessor() {
        // Contender 2 timed out and left.
        let snapshot = vec![name("a", 1), name("c", 3)];
        assert_eq!(
            resolve(&name("c", 3), &snapshot).watch_target(),
            Some(name("a", 1).as_str())
        );
    }

    #[test]
    fn test_foreign_children_are_ignored() {
        let snapshot = vec!["readme".to_string(), name("a", 5)];
        assert!(resolve(&name("a", 5), &snapshot).is_holder());
    }

    #[test]
    fn test_missing_own_node() {
        let snapshot = vec![name("a", 1)];
        assert_eq!(resolve(&name("b", 2), &snapshot), QueuePosition::Missing);
    }
}
