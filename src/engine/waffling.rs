//! Label oscillation detection.
//!
//! A label "waffles" when its applied/removed history keeps flip-flopping,
//! which means the policy and a human actor disagree. Reconciliation refuses
//! to touch a waffling label and fails the item instead of applying another
//! flip.

use chrono::{DateTime, Duration, Utc};

use crate::item::{LabelAction, LabelEvent};

/// Count direction changes for `label` within the lookback window, scanning
/// the log in reverse chronological order. Returns true once the number of
/// alternations exceeds `tolerance`.
///
/// Pure function of the log; the caller supplies `now` so tests stay
/// deterministic.
pub fn is_waffling(
    events: &[LabelEvent],
    label: &str,
    tolerance: u32,
    lookback: Duration,
    now: DateTime<Utc>,
) -> bool {
    let cutoff = now - lookback;
    let mut alternations: u32 = 0;
    let mut previous: Option<LabelAction> = None;

    for event in events.iter().rev() {
        if event.label != label {
            continue;
        }
        if event.timestamp < cutoff {
            break;
        }
        if let Some(prev) = previous {
            if prev != event.action {
                alternations += 1;
                if alternations > tolerance {
                    return true;
                }
            }
        }
        previous = Some(event.action);
    }

    false
}
