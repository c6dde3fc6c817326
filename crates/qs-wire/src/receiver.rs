//! Client-side view of subscription frames.

use std::collections::HashMap;

use crate::diff::apply_patch;
use crate::error::{WireError, WireResult};
use crate::frame::OutgoingFrame;
use crate::payload::Payload;

/// What a subscription currently holds on the receiving end.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedValue {
    pub checksum: u64,
    pub payload: Payload,
}

/// Tracks the latest value per subscription id and applies diffs against it.
#[derive(Debug, Default)]
pub struct ReceiverCache {
    values: HashMap<u64, ReceivedValue>,
}

impl ReceiverCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<&ReceivedValue> {
        self.values.get(&id)
    }

    /// Checksum to announce when (re)subscribing, `0` if nothing is held.
    pub fn checksum(&self, id: u64) -> u64 {
        self.values.get(&id).map_or(0, |v| v.checksum)
    }

    pub fn forget(&mut self, id: u64) {
        self.values.remove(&id);
    }

    /// Apply a subscription frame. Returns the id that changed, or `None` for
    /// frames that carry no subscription value.
    pub fn apply(&mut self, frame: &OutgoingFrame) -> WireResult<Option<u64>> {
        match frame {
            OutgoingFrame::SubscriptionData {
                id,
                checksum,
                payload,
            } => {
                self.values.insert(
                    *id,
                    ReceivedValue {
                        checksum: *checksum,
                        payload: payload.clone(),
                    },
                );
                Ok(Some(*id))
            }
            OutgoingFrame::SubscriptionDiff {
                id,
                checksum,
                previous_checksum,
                patch,
            } => {
                let held = self.checksum(*id);
                let current = match self.values.get(id) {
                    Some(v) if v.checksum == *previous_checksum => v,
                    _ => {
                        return Err(WireError::UnknownDiffBase {
                            id: *id,
                            base: *previous_checksum,
                            held,
                        })
                    }
                };
                let base = current.payload.to_json();
                let next = apply_patch(&base, patch)?;
                self.values.insert(
                    *id,
                    ReceivedValue {
                        checksum: *checksum,
                        payload: Payload::from(next),
                    },
                );
                Ok(Some(*id))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use serde_json::json;

    #[test]
    fn test_diff_applies_on_matching_base() {
        let mut cache = ReceiverCache::new();
        let old = json!([{"id": 1}, {"id": 2}]);
        let new = json!([{"id": 1}, {"id": 2}, {"id": 3}]);
        cache
            .apply(&OutgoingFrame::SubscriptionData {
                id: 1,
                checksum: 111,
                payload: Payload::from(old.clone()),
            })
            .unwrap();
        cache
            .apply(&OutgoingFrame::SubscriptionDiff {
                id: 1,
                checksum: 222,
                previous_checksum: 111,
                patch: diff(&old, &new),
            })
            .unwrap();
        assert_eq!(
            cache.get(1),
            Some(&ReceivedValue {
                checksum: 222,
                payload: Payload::from(new)
            })
        );
    }

    #[test]
    fn test_diff_with_unseen_base_rejected() {
        let mut cache = ReceiverCache::new();
        let err = cache
            .apply(&OutgoingFrame::SubscriptionDiff {
                id: 4,
                checksum: 2,
                previous_checksum: 1,
                patch: json!([0, 1]),
            })
            .unwrap_err();
        assert_eq!(
            err,
            WireError::UnknownDiffBase {
                id: 4,
                base: 1,
                held: 0
            }
        );
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn test_non_subscription_frames_ignored() {
        let mut cache = ReceiverCache::new();
        assert_eq!(cache.apply(&OutgoingFrame::GetUpToDate { id: 1 }).unwrap(), None);
    }
}
