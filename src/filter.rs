//! Filter matcher: §4.2.
//!
//! A filter is a set of (property name, value) pairs. It matches a
//! channel when every pair is present in the channel's property map
//! with a semantically equal value (see [`crate::value::Value::matches`]).

use std::collections::BTreeMap;

use crate::channel::Channel;
use crate::registry::client::{CapabilityKind, Client};
use crate::value::Value;

/// A single filter rule. An empty filter matches every channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    entries: BTreeMap<String, Value>,
}

impl Filter {
    pub fn new(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in a stable (sorted by name) order, used by the
    /// descriptor serialiser for canonical round-tripping.
    pub fn entries_sorted(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Score this filter against one channel: `len + 1` if every entry
    /// matches, `0` otherwise. The `+1` bias makes even the empty
    /// filter score non-zero and lets more specific filters outrank
    /// less specific ones in client comparisons.
    pub fn score(&self, channel: &Channel) -> u32 {
        let all_match = self
            .entries
            .iter()
            .all(|(name, expected)| channel.property(name).is_some_and(|actual| expected.matches(actual)));
        if all_match {
            self.entries.len() as u32 + 1
        } else {
            0
        }
    }
}

/// The best-scoring filter in a client's filter list against one
/// channel, or `0` if none match.
pub fn best_score(filters: &[Filter], channel: &Channel) -> u32 {
    filters.iter().map(|f| f.score(channel)).max().unwrap_or(0)
}

/// Total score of a client's filter list across a batch of channels.
/// Per spec, a client disqualifies itself for the whole batch the
/// moment any single channel scores 0.
pub fn batch_score(filters: &[Filter], channels: &[Channel]) -> Option<u32> {
    let mut total = 0u32;
    for channel in channels {
        let score = best_score(filters, channel);
        if score == 0 {
            return None;
        }
        total += score;
    }
    Some(total)
}

/// One candidate in a best-handler ranking (§4.2 "Best-handler
/// selection"): a client qualified for every channel in the batch,
/// with its summed score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedHandler {
    pub bus_name: String,
    pub total_score: u32,
    pub bypass_approval: bool,
}

/// Rank every client with the `Handler` capability against a batch.
/// Disqualifies (drops) any client that scores 0 on any channel.
/// Sorted bypass-approval-first, then by descending score, then by
/// bus name for a fully deterministic tie-break.
pub fn rank_handlers(clients: &[Client], channels: &[Channel]) -> Vec<RankedHandler> {
    let mut ranked: Vec<RankedHandler> = clients
        .iter()
        .filter(|c| c.has(CapabilityKind::Handler))
        .filter_map(|c| {
            batch_score(c.filters_for(CapabilityKind::Handler), channels).map(|total_score| RankedHandler {
                bus_name: c.bus_name.clone(),
                total_score,
                bypass_approval: c.bypass_approval,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.bypass_approval
            .cmp(&a.bypass_approval)
            .then(b.total_score.cmp(&a.total_score))
            .then(a.bus_name.cmp(&b.bus_name))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelPath;
    use crate::value::PropertyMap;

    fn channel_with(props: &[(&str, Value)]) -> Channel {
        let mut map = PropertyMap::new();
        for (k, v) in props {
            map.insert(k.to_string(), v.clone());
        }
        Channel::new(ChannelPath("/c".into()), map)
    }

    #[test]
    fn empty_filter_matches_everything_with_score_one() {
        let f = Filter::empty();
        let c = channel_with(&[("type", Value::Str("text".into()))]);
        assert_eq!(f.score(&c), 1);
    }

    #[test]
    fn n_entry_filter_scores_n_plus_one_when_satisfied() {
        let mut entries = BTreeMap::new();
        entries.insert("type".to_string(), Value::Str("text".into()));
        entries.insert("requires-target".to_string(), Value::Bool(false));
        let f = Filter::new(entries);

        let c = channel_with(&[
            ("type", Value::Str("text".into())),
            ("requires-target", Value::Bool(false)),
        ]);
        assert_eq!(f.score(&c), 3);
    }

    #[test]
    fn missing_property_fails_the_filter() {
        let mut entries = BTreeMap::new();
        entries.insert("type".to_string(), Value::Str("text".into()));
        let f = Filter::new(entries);
        let c = channel_with(&[]);
        assert_eq!(f.score(&c), 0);
    }

    #[test]
    fn type_mismatch_fails_the_filter() {
        let mut entries = BTreeMap::new();
        entries.insert("type".to_string(), Value::Str("text".into()));
        let f = Filter::new(entries);
        let c = channel_with(&[("type", Value::Bool(true))]);
        assert_eq!(f.score(&c), 0);
    }

    #[test]
    fn batch_score_disqualifies_on_any_zero() {
        let mut entries = BTreeMap::new();
        entries.insert("type".to_string(), Value::Str("text".into()));
        let f = Filter::new(entries);

        let matching = channel_with(&[("type", Value::Str("text".into()))]);
        let not_matching = channel_with(&[("type", Value::Str("voice".into()))]);

        assert_eq!(batch_score(&[f.clone()], &[matching.clone()]), Some(2));
        assert_eq!(batch_score(&[f], &[matching, not_matching]), None);
    }

    #[test]
    fn best_score_takes_the_max_of_several_filters() {
        let loose = Filter::empty();
        let mut strict_entries = BTreeMap::new();
        strict_entries.insert("type".to_string(), Value::Str("text".into()));
        let strict = Filter::new(strict_entries);

        let c = channel_with(&[("type", Value::Str("text".into()))]);
        assert_eq!(best_score(&[loose, strict], &c), 2);
    }

    fn handler_with(name: &str, filter: Filter, bypass_approval: bool) -> Client {
        let mut c = Client::new(name.to_string(), false, true);
        c.capabilities.handler = true;
        c.handler_filters.push(filter);
        c.bypass_approval = bypass_approval;
        c
    }

    #[test]
    fn rank_handlers_prefers_bypass_then_score_then_name() {
        let c = channel_with(&[("type", Value::Str("text".into()))]);

        let mut strict_entries = BTreeMap::new();
        strict_entries.insert("type".to_string(), Value::Str("text".into()));

        let loose = handler_with("org.example.H1", Filter::empty(), false);
        let strict = handler_with("org.example.H2", Filter::new(strict_entries.clone()), false);
        let bypass = handler_with("org.example.H3", Filter::new(strict_entries), true);

        let ranked = rank_handlers(&[loose, strict, bypass], &[c]);
        assert_eq!(ranked[0].bus_name, "org.example.H3");
        assert_eq!(ranked[1].bus_name, "org.example.H2");
        assert_eq!(ranked[2].bus_name, "org.example.H1");
    }

    #[test]
    fn rank_handlers_drops_clients_that_fail_any_channel() {
        let matching = channel_with(&[("type", Value::Str("text".into()))]);
        let not_matching = channel_with(&[("type", Value::Str("voice".into()))]);

        let mut entries = BTreeMap::new();
        entries.insert("type".to_string(), Value::Str("text".into()));
        let strict = handler_with("org.example.H1", Filter::new(entries), false);

        let ranked = rank_handlers(&[strict], &[matching, not_matching]);
        assert!(ranked.is_empty());
    }
}
