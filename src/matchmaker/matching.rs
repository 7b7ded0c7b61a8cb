//! Pairing strategies for choosing which waiting users to put together
//!
//! A strategy only decides; the matchmaker owns every state change.

use crate::types::QueueEntry;

/// Configuration for pairing behavior
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Let shared interest tags pick the partner among compatible candidates
    pub prefer_shared_interests: bool,
    /// How many compatible candidates behind the head of the line are considered
    /// when interests decide the partner
    pub interest_lookahead: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            prefer_shared_interests: false,
            interest_lookahead: 4,
        }
    }
}

/// Trait for pairing algorithms
///
/// Inputs are always ordered oldest first, as returned by
/// [`WaitingQueue::list_unpaired`](crate::queue::WaitingQueue::list_unpaired).
pub trait PairingStrategy: Send + Sync {
    /// Pick the next pair to put into a new session
    fn select_pair(&self, unpaired: &[QueueEntry]) -> Option<(QueueEntry, QueueEntry)>;

    /// Pick the entry that should fill a forming session already holding `reserved`
    fn select_joiner(&self, reserved: &[QueueEntry], unpaired: &[QueueEntry])
        -> Option<QueueEntry>;

    /// Whether two searches may be paired at all
    fn is_compatible(&self, a: &QueueEntry, b: &QueueEntry) -> bool {
        a.user_id != b.user_id && a.filters.is_compatible_with(&b.filters)
    }
}

/// First-in first-out pairing
///
/// The oldest waiting user is paired with the oldest compatible user behind
/// them. Filters only ever skip over incompatible users; with every filter set
/// to `Any` this is plain FIFO.
#[derive(Debug, Default)]
pub struct FifoPairingStrategy {
    config: MatchingConfig,
}

impl FifoPairingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MatchingConfig) -> Self {
        Self { config }
    }

    fn choose_partner<'a>(
        &self,
        head: &QueueEntry,
        candidates: impl Iterator<Item = &'a QueueEntry>,
    ) -> Option<&'a QueueEntry> {
        let mut compatible = candidates.filter(|candidate| self.is_compatible(head, candidate));

        if !self.config.prefer_shared_interests || head.filters.interests.is_empty() {
            return compatible.next();
        }

        // max_by_key returns the last maximum, so walk the window in reverse to keep
        // the oldest candidate on ties
        let window: Vec<&QueueEntry> = compatible
            .take(self.config.interest_lookahead.max(1))
            .collect();
        window
            .into_iter()
            .rev()
            .max_by_key(|candidate| head.filters.shared_interests(&candidate.filters))
    }
}

impl PairingStrategy for FifoPairingStrategy {
    fn select_pair(&self, unpaired: &[QueueEntry]) -> Option<(QueueEntry, QueueEntry)> {
        unpaired.iter().enumerate().find_map(|(index, head)| {
            self.choose_partner(head, unpaired[index + 1..].iter())
                .map(|partner| (head.clone(), partner.clone()))
        })
    }

    fn select_joiner(
        &self,
        reserved: &[QueueEntry],
        unpaired: &[QueueEntry],
    ) -> Option<QueueEntry> {
        unpaired
            .iter()
            .find(|candidate| {
                reserved
                    .iter()
                    .all(|holder| self.is_compatible(holder, candidate))
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Campus, ConnectionType, SearchFilters};
    use crate::utils::current_timestamp;

    fn entry(user_id: &str, offset_ms: i64, filters: SearchFilters) -> QueueEntry {
        QueueEntry {
            user_id: user_id.to_string(),
            enqueued_at: current_timestamp() + chrono::Duration::milliseconds(offset_ms),
            session_id: None,
            filters,
        }
    }

    fn campus(campus: Campus) -> SearchFilters {
        SearchFilters {
            campus,
            ..SearchFilters::default()
        }
    }

    #[test]
    fn test_fewer_than_two_entries() {
        let strategy = FifoPairingStrategy::new();
        assert!(strategy.select_pair(&[]).is_none());
        assert!(strategy
            .select_pair(&[entry("a", 0, SearchFilters::any())])
            .is_none());
    }

    #[test]
    fn test_pairs_two_oldest() {
        let strategy = FifoPairingStrategy::new();
        let entries = vec![
            entry("a", 0, SearchFilters::any()),
            entry("b", 1, SearchFilters::any()),
            entry("c", 2, SearchFilters::any()),
        ];

        let (first, second) = strategy.select_pair(&entries).unwrap();
        assert_eq!(first.user_id, "a");
        assert_eq!(second.user_id, "b");
    }

    #[test]
    fn test_incompatible_head_is_skipped_over() {
        let strategy = FifoPairingStrategy::new();
        let entries = vec![
            entry("cebu", 0, campus(Campus::Cebu)),
            entry("diliman-1", 1, campus(Campus::Diliman)),
            entry("diliman-2", 2, campus(Campus::Diliman)),
        ];

        let (first, second) = strategy.select_pair(&entries).unwrap();
        assert_eq!(first.user_id, "diliman-1");
        assert_eq!(second.user_id, "diliman-2");
    }

    #[test]
    fn test_any_bridges_constraints() {
        let strategy = FifoPairingStrategy::new();
        let entries = vec![
            entry("dating", 0, SearchFilters {
                connection_type: ConnectionType::Dating,
                ..SearchFilters::default()
            }),
            entry("study", 1, SearchFilters {
                connection_type: ConnectionType::StudyBuddy,
                ..SearchFilters::default()
            }),
            entry("open", 2, SearchFilters::any()),
        ];

        let (first, second) = strategy.select_pair(&entries).unwrap();
        assert_eq!(first.user_id, "dating");
        assert_eq!(second.user_id, "open");
    }

    #[test]
    fn test_no_compatible_pair() {
        let strategy = FifoPairingStrategy::new();
        let entries = vec![
            entry("manila", 0, campus(Campus::Manila)),
            entry("cebu", 1, campus(Campus::Cebu)),
        ];
        assert!(strategy.select_pair(&entries).is_none());
    }

    #[test]
    fn test_joiner_must_suit_reserved_holder() {
        let strategy = FifoPairingStrategy::new();
        let reserved = vec![entry("holder", 0, campus(Campus::Diliman))];
        let unpaired = vec![
            entry("manila", 1, campus(Campus::Manila)),
            entry("diliman", 2, campus(Campus::Diliman)),
        ];

        let joiner = strategy.select_joiner(&reserved, &unpaired).unwrap();
        assert_eq!(joiner.user_id, "diliman");

        // Empty forming session takes the oldest entry
        let joiner = strategy.select_joiner(&[], &unpaired).unwrap();
        assert_eq!(joiner.user_id, "manila");
    }

    #[test]
    fn test_shared_interests_pick_partner_when_enabled() {
        let tagged = |user_id: &str, offset: i64, tags: &[&str]| {
            entry(user_id, offset, SearchFilters {
                interests: tags.iter().map(|t| t.to_string()).collect(),
                ..SearchFilters::default()
            })
        };
        let entries = vec![
            tagged("head", 0, &["#Math21Study"]),
            tagged("plain", 1, &[]),
            tagged("mathy", 2, &["#math21study"]),
        ];

        let fifo = FifoPairingStrategy::new();
        assert_eq!(fifo.select_pair(&entries).unwrap().1.user_id, "plain");

        let by_interest = FifoPairingStrategy::with_config(MatchingConfig {
            prefer_shared_interests: true,
            interest_lookahead: 4,
        });
        assert_eq!(by_interest.select_pair(&entries).unwrap().1.user_id, "mathy");
    }
}
