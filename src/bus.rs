//! The telemetry bus is the host's data hub: the sender subscribes to deltas from it, the
//!  receiver re-injects decoded deltas into it, and connectivity measurements are published
//!  to it.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::model::Delta;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TelemetryBus: Send + Sync {
    async fn publish(&self, source_id: &str, delta: Delta) -> anyhow::Result<()>;
}

/// Drops updates originating from NMEA sentences that are not worth the bandwidth (e.g. `GSV`
///  satellite details). Sentence tags are matched case insensitively.
#[derive(Debug, Clone, Default)]
pub struct SentenceFilter {
    excluded: FxHashSet<String>,
}

impl SentenceFilter {
    pub fn new<'a>(excluded: impl IntoIterator<Item = &'a String>) -> SentenceFilter {
        SentenceFilter {
            excluded: excluded.into_iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }

    fn is_excluded(&self, sentence: &str) -> bool {
        self.excluded.contains(&sentence.to_ascii_uppercase())
    }

    /// Removes excluded updates from a delta. Returns `None` if nothing is left to send.
    pub fn apply(&self, mut delta: Delta) -> Option<Delta> {
        if self.excluded.is_empty() {
            return Some(delta);
        }

        let num_updates = delta.updates.len();
        delta.updates.retain(|u| {
            match u.source.as_ref().and_then(|s| s.sentence.as_deref()) {
                Some(sentence) => !self.is_excluded(sentence),
                None => true,
            }
        });

        if delta.updates.is_empty() && num_updates > 0 {
            trace!("filtered delta for {} completely", delta.context);
            return None;
        }
        Some(delta)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use crate::model::Source;
    use crate::test_util::delta::{gsv_delta, sample_delta};

    fn filter(excluded: &[&str]) -> SentenceFilter {
        let excluded = excluded.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        SentenceFilter::new(&excluded)
    }

    #[rstest]
    #[case::exact(&["GSV"], true)]
    #[case::lower_case(&["gsv"], true)]
    #[case::padded(&[" GSV "], true)]
    #[case::among_others(&["GSA", "GSV", "RMC"], true)]
    #[case::other_sentence(&["GSA"], false)]
    #[case::nothing_excluded(&[], false)]
    fn test_gsv(#[case] excluded: &[&str], #[case] expect_dropped: bool) {
        assert_eq!(filter(excluded).apply(gsv_delta()).is_none(), expect_dropped);
    }

    #[test]
    fn test_untagged_updates_pass() {
        let delta = sample_delta(0);
        assert_eq!(filter(&["GSV"]).apply(delta.clone()), Some(delta));
    }

    #[test]
    fn test_partial_filtering() {
        let mut delta = gsv_delta();
        let mut rmc = sample_delta(0).updates.remove(0);
        rmc.source = Some(Source { sentence: Some("RMC".to_string()), ..Default::default() });
        delta.updates.push(rmc.clone());

        let filtered = filter(&["GSV"]).apply(delta).unwrap();
        assert_eq!(filtered.updates, vec![rmc]);
    }

    #[test]
    fn test_empty_filter() {
        assert!(filter(&["", "  "]).is_empty());
    }
}
