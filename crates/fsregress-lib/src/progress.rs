//! Percent-complete reporting for long workload phases

use std::io::Write;

use log::debug;

/// Emits percent-complete for one phase.
///
/// Each new percent prints a single `.`; crossing a multiple of ten prints
/// the percent reached as `N%` and ends the line. A percent that was already emitted is
/// never emitted again, so a phase of a million items produces at most a
/// hundred dots.
pub struct ProgressTracker<'a> {
    out: &'a mut dyn Write,
    last_percent: Option<u64>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self {
            out,
            last_percent: None,
        }
    }

    /// Forget the last emitted percent.
    pub fn reset(&mut self) {
        self.last_percent = None;
    }

    pub fn last_percent(&self) -> Option<u64> {
        self.last_percent
    }

    /// Record that item `index` (0-based) of `total` finished.
    ///
    /// Returns the percent emitted by this call, if any.
    pub fn report(&mut self, index: u64, total: u64) -> Option<u64> {
        if total == 0 {
            return None;
        }

        let percent = ((u128::from(index) + 1) * 100 / u128::from(total)) as u64;
        let previous = self.last_percent.unwrap_or(0);
        if percent == previous {
            return None;
        }

        let crossed_milestone = percent / 10 > previous / 10;
        let result = if crossed_milestone {
            writeln!(self.out, ".{}%", percent)
        } else {
            write!(self.out, ".")
        };
        if let Err(e) = result.and_then(|_| self.out.flush()) {
            debug!("ProgressTracker::report: write failed: {}", e);
        }

        self.last_percent = Some(percent);
        Some(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(total: u64) -> (String, Vec<u64>) {
        let mut out = Vec::new();
        let mut emitted = Vec::new();
        {
            let mut tracker = ProgressTracker::new(&mut out);
            for i in 0..total {
                if let Some(p) = tracker.report(i, total) {
                    emitted.push(p);
                }
            }
        }
        (String::from_utf8(out).unwrap(), emitted)
    }

    #[test]
    fn test_zero_total_is_noop() {
        let mut out = Vec::new();
        let mut tracker = ProgressTracker::new(&mut out);
        assert_eq!(tracker.report(0, 0), None);
        assert_eq!(tracker.report(5, 0), None);
        drop(tracker);
        assert!(out.is_empty());
    }

    #[test]
    fn test_hundred_items_emit_every_percent() {
        let (text, emitted) = run(100);
        assert_eq!(emitted, (1..=100).collect::<Vec<_>>());
        assert_eq!(text.matches('%').count(), 10);
        assert!(text.ends_with("100%\n"));
    }

    #[test]
    fn test_large_total_emits_no_duplicates() {
        let (text, emitted) = run(100_000);
        assert_eq!(emitted.len(), 100);
        assert!(emitted.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(emitted.last(), Some(&100));
        assert_eq!(text.matches('.').count(), 100);
    }

    #[test]
    fn test_small_total_jumps_percent() {
        let (text, emitted) = run(3);
        assert_eq!(emitted, vec![33, 66, 100]);
        assert_eq!(text, ".33%\n.66%\n.100%\n");
    }

    #[test]
    fn test_milestone_shows_percent_reached() {
        let mut out = Vec::new();
        let mut tracker = ProgressTracker::new(&mut out);
        assert_eq!(tracker.report(7, 100), Some(8));
        assert_eq!(tracker.report(9, 100), Some(10));
        assert_eq!(tracker.report(32, 100), Some(33));
        drop(tracker);
        assert_eq!(String::from_utf8(out).unwrap(), "..10%\n.33%\n");
    }

    #[test]
    fn test_reset_allows_reemission() {
        let mut out = Vec::new();
        let mut tracker = ProgressTracker::new(&mut out);
        assert_eq!(tracker.report(0, 1), Some(100));
        assert_eq!(tracker.report(0, 1), None);
        tracker.reset();
        assert_eq!(tracker.last_percent(), None);
        assert_eq!(tracker.report(0, 1), Some(100));
    }

    #[test]
    fn test_sub_percent_progress_is_silent() {
        let mut out = Vec::new();
        let mut tracker = ProgressTracker::new(&mut out);
        assert_eq!(tracker.report(0, 1000), None);
        assert_eq!(tracker.report(9, 1000), Some(1));
    }
}
