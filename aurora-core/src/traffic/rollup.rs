//! The per-port usage update rule.
//!
//! `download`/`upload` track what the host's counters currently show
//! plus the rolled-forward accumulate; the accumulate pair survives
//! host-side counter resets; the checkpoint pair remembers the raw
//! counter last applied, which is how an intervening reset (checkpoint
//! rewritten under the collector's feet) is detected and that pass's
//! delta skipped.

use aurora_model::PortUsage;

/// Raw byte counters observed on the host for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficObservation {
    pub download: i64,
    pub upload: i64,
}

/// Apply one observation. `prev` is the usage snapshot loaded when the
/// pass started; `current` is the row re-read inside the writing
/// transaction. A direction is applied only when no one rewrote its
/// checkpoint in between (or there was no previous snapshot at all).
/// With `accumulate` set the result also becomes the new accumulate
/// baseline.
pub fn roll_usage(
    current: PortUsage,
    prev: Option<&PortUsage>,
    observed: &TrafficObservation,
    accumulate: bool,
) -> PortUsage {
    let mut next = current;

    let download_stable = prev
        .map(|p| p.download_checkpoint == current.download_checkpoint)
        .unwrap_or(true);
    if download_stable {
        let download = observed.download + current.download_accumulate;
        next.download = download;
        if accumulate {
            next.download_accumulate = download;
        }
        next.download_checkpoint = observed.download;
    }

    let upload_stable = prev
        .map(|p| p.upload_checkpoint == current.upload_checkpoint)
        .unwrap_or(true);
    if upload_stable {
        let upload = observed.upload + current.upload_accumulate;
        next.upload = upload;
        if accumulate {
            next.upload_accumulate = upload;
        }
        next.upload_checkpoint = observed.upload;
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(
        download: i64,
        accumulate: i64,
        checkpoint: i64,
    ) -> PortUsage {
        PortUsage {
            port_id: 1,
            download,
            upload: 0,
            download_accumulate: accumulate,
            upload_accumulate: 0,
            download_checkpoint: checkpoint,
            upload_checkpoint: 0,
        }
    }

    #[test]
    fn first_observation_applies_unconditionally() {
        let next = roll_usage(
            PortUsage::default(),
            None,
            &TrafficObservation {
                download: 600,
                upload: 0,
            },
            false,
        );
        assert_eq!(next.download, 600);
        assert_eq!(next.download_accumulate, 0);
        assert_eq!(next.download_checkpoint, 600);
    }

    #[test]
    fn stable_checkpoint_adds_accumulate() {
        let current = usage(800, 300, 500);
        let prev = current;
        let next = roll_usage(
            current,
            Some(&prev),
            &TrafficObservation {
                download: 550,
                upload: 0,
            },
            false,
        );
        assert_eq!(next.download, 850);
        assert_eq!(next.download_accumulate, 300);
        assert_eq!(next.download_checkpoint, 550);
    }

    #[test]
    fn accumulate_pass_moves_baseline() {
        let current = usage(800, 300, 500);
        let prev = current;
        let next = roll_usage(
            current,
            Some(&prev),
            &TrafficObservation {
                download: 550,
                upload: 0,
            },
            true,
        );
        assert_eq!(next.download, 850);
        assert_eq!(next.download_accumulate, 850);
    }

    /// Host counter reset mid-interval: the first post-reset collection
    /// sees the checkpoint changed under it and skips; the reconciler's
    /// accumulate pass then rolls the new counters forward.
    #[test]
    fn reset_between_collections() {
        // Before: accumulate=800, checkpoint=800. A reconcile reset the
        // host counters and zeroed the checkpoints in between.
        let snapshot_at_pass_start = usage(800, 800, 800);
        let row_now = usage(800, 800, 0);

        // First post-reset collection: checkpoint differs, delta skipped.
        let next = roll_usage(
            row_now,
            Some(&snapshot_at_pass_start),
            &TrafficObservation {
                download: 50,
                upload: 0,
            },
            false,
        );
        assert_eq!(next.download, 800, "skipped pass keeps old value");
        assert_eq!(next.download_checkpoint, 0);

        // Next pass (reconciler hook, accumulate=true): checkpoints now
        // agree, so the delta lands on top of the old accumulate.
        let prev = next;
        let rolled = roll_usage(
            next,
            Some(&prev),
            &TrafficObservation {
                download: 50,
                upload: 0,
            },
            true,
        );
        assert_eq!(rolled.download, 850);
        assert_eq!(rolled.download_accumulate, 850);
        assert_eq!(rolled.download_checkpoint, 50);
    }

    #[test]
    fn directions_are_independent() {
        let mut current = usage(100, 0, 100);
        current.upload = 40;
        current.upload_checkpoint = 40;
        let mut prev = current;
        prev.download_checkpoint = 900; // download was reset mid-pass

        let next = roll_usage(
            current,
            Some(&prev),
            &TrafficObservation {
                download: 5,
                upload: 70,
            },
            false,
        );
        assert_eq!(next.download, 100, "download skipped");
        assert_eq!(next.upload, 70, "upload applied");
    }
}
