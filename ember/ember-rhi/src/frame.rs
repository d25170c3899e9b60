//! Frame bookkeeping shared by both backends: the submission timeline, the data transfer
//! window, frame versions, and render pass grouping.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::MAX_FRAME_VERSIONS;
use crate::error::{Result, RhiError};

/// Monotonic submission counter. Index 0 means "never submitted" and is always complete.
#[derive(Debug, Default)]
pub struct SubmissionTimeline {
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl SubmissionTimeline {
    pub fn next_submission(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn last_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Queues retire in order, so completing `index` completes everything before it.
    pub fn mark_complete(&self, index: u64) {
        self.completed.fetch_max(index, Ordering::AcqRel);
    }

    pub fn mark_all_complete(&self) {
        self.mark_complete(self.last_submitted());
    }

    pub fn is_complete(&self, index: u64) -> bool {
        index <= self.last_completed()
    }
}

/// Tracks the `begin_data_transfer` / `end_data_transfer` bracket.
#[derive(Debug, Default)]
pub struct TransferWindow {
    open: bool,
}

impl TransferWindow {
    pub fn begin(&mut self, validate: bool) -> Result<()> {
        if validate && self.open {
            return Err(RhiError::contract("begin_data_transfer while a transfer is already open"));
        }
        self.open = true;
        Ok(())
    }

    pub fn end(&mut self, validate: bool) -> Result<()> {
        if validate && !self.open {
            return Err(RhiError::contract("end_data_transfer without begin_data_transfer"));
        }
        self.open = false;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Resource mutation is only allowed while the window is open.
    pub fn require_open(&self, validate: bool, what: &str) -> Result<()> {
        if validate && !self.open {
            return Err(RhiError::contract(format!("{what} outside begin_data_transfer/end_data_transfer")));
        }
        Ok(())
    }

    /// Submitting GPU work while CPU writes are still being staged.
    pub fn require_closed(&self, validate: bool, what: &str) -> Result<()> {
        if validate && self.open {
            return Err(RhiError::contract(format!("{what} while a data transfer is open")));
        }
        Ok(())
    }
}

/// Which frame versions have finished transfer work that no render submission has waited on yet.
/// A finished transfer queues its own wait, so the next submission is ordered after it.
#[derive(Debug, Clone)]
pub struct TransferSignals {
    signaled: Vec<bool>,
    pending_wait: Vec<u32>,
}

impl TransferSignals {
    pub fn new(versions: u32) -> Self {
        Self { signaled: vec![false; versions as usize], pending_wait: Vec::new() }
    }

    pub fn resize(&mut self, versions: u32) {
        self.signaled.resize(versions as usize, false);
        self.pending_wait.retain(|&v| v < versions);
    }

    pub fn signal(&mut self, version: u32) {
        if let Some(s) = self.signaled.get_mut(version as usize) {
            *s = true;
            self.queue_wait(version);
        }
    }

    fn queue_wait(&mut self, version: u32) {
        if !self.pending_wait.contains(&version) {
            self.pending_wait.push(version);
        }
    }

    /// Make sure the next render submission waits on `version`'s transfer signal.
    /// The signal stays valid until a submission consumes it.
    pub fn barrier(&mut self, version: u32, validate: bool) -> Result<bool> {
        let Some(&signaled) = self.signaled.get(version as usize) else {
            return Err(RhiError::contract(format!("transfer_barrier on unknown frame version {version}")));
        };
        if !signaled {
            if validate {
                return Err(RhiError::contract(format!(
                    "transfer_barrier({version}) without a finished data transfer for that version"
                )));
            }
            return Ok(false);
        }
        self.queue_wait(version);
        Ok(true)
    }

    /// Versions the next render submission must wait on. Their signals are consumed.
    pub fn take_waits(&mut self) -> Vec<u32> {
        let waits = std::mem::take(&mut self.pending_wait);
        for &v in &waits {
            if let Some(s) = self.signaled.get_mut(v as usize) {
                *s = false;
            }
        }
        waits
    }

    /// Drop any outstanding signal or queued wait for `version` before it is signalled again.
    /// Returns whether the native signal still has to be waited on.
    pub fn release(&mut self, version: u32) -> bool {
        let pending = self.pending_wait.iter().position(|&v| v == version).map(|i| self.pending_wait.remove(i));
        let signaled = self.signaled.get_mut(version as usize).map(std::mem::take).unwrap_or(false);
        signaled || pending.is_some()
    }
}

/// The round-robin pool of frame versions.
#[derive(Debug, Clone, Copy)]
pub struct FrameVersions {
    count: u32,
    current: u32,
}

impl FrameVersions {
    pub fn new(count: u32) -> Result<Self> {
        check_version_count(count)?;
        Ok(Self { count, current: 0 })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn resize(&mut self, count: u32) -> Result<()> {
        check_version_count(count)?;
        self.count = count;
        self.current %= count;
        Ok(())
    }

    /// Select the active version. Callers typically pass `frame_counter % count`.
    pub fn select(&mut self, version: u32) -> u32 {
        self.current = version % self.count;
        self.current
    }
}

fn check_version_count(count: u32) -> Result<()> {
    if count == 0 || count > MAX_FRAME_VERSIONS {
        return Err(RhiError::unsupported(format!(
            "frame version count {count} out of range 1..={MAX_FRAME_VERSIONS}"
        )));
    }
    Ok(())
}

/// Index ranges of the three groups of an `execute_render_pass` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassGroups {
    pub pre: Range<usize>,
    pub in_pass: Range<usize>,
    pub post: Range<usize>,
}

/// Split a batch by recording mode into standalone buffers before the pass, render-pass buffers,
/// and standalone buffers after it. A render-pass buffer after the post group breaks the order.
pub fn group_passes(in_pass: impl IntoIterator<Item = bool>, validate: bool) -> Result<PassGroups> {
    let flags: Vec<bool> = in_pass.into_iter().collect();
    let first = flags.iter().position(|&p| p).unwrap_or(flags.len());
    let end = flags.iter().rposition(|&p| p).map_or(first, |i| i + 1);
    if validate {
        if let Some(i) = flags[first..end].iter().position(|&p| !p) {
            return Err(RhiError::contract(format!(
                "command buffers must be in 3 groups (pre-pass, render pass, post-pass); \
                 standalone buffer {} sits between render pass buffers",
                first + i
            )));
        }
    }
    Ok(PassGroups { pre: 0..first, in_pass: first..end, post: end..flags.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_completion_is_monotonic() {
        let timeline = SubmissionTimeline::default();
        assert!(timeline.is_complete(0));
        let a = timeline.next_submission();
        let b = timeline.next_submission();
        assert!(!timeline.is_complete(a));
        timeline.mark_complete(b);
        assert!(timeline.is_complete(a));
        timeline.mark_complete(a);
        assert_eq!(timeline.last_completed(), b);
    }

    #[test]
    fn transfer_window_bracket() {
        let mut window = TransferWindow::default();
        assert!(window.require_open(true, "buffer_set_data").is_err());
        window.begin(true).unwrap();
        assert!(window.begin(true).is_err());
        window.require_open(true, "buffer_set_data").unwrap();
        assert!(window.require_closed(true, "execute_render_pass").is_err());
        window.end(true).unwrap();
        assert!(window.end(true).is_err());
        window.require_open(false, "buffer_set_data").unwrap();
    }

    #[test]
    fn transfer_signal_is_consumed_by_one_submission() {
        let mut signals = TransferSignals::new(2);
        assert!(signals.barrier(1, true).is_err());
        signals.signal(1);
        assert!(signals.barrier(1, true).unwrap());
        assert!(signals.barrier(1, true).unwrap());
        assert_eq!(signals.take_waits(), vec![1]);
        assert!(signals.take_waits().is_empty());
        assert!(signals.barrier(1, true).is_err());
        assert!(signals.barrier(5, true).is_err());
    }

    #[test]
    fn finished_transfer_is_waited_on_without_a_barrier() {
        let mut signals = TransferSignals::new(2);
        signals.signal(0);
        signals.signal(1);
        assert_eq!(signals.take_waits(), vec![0, 1]);
        assert!(signals.take_waits().is_empty());
    }

    #[test]
    fn release_clears_unconsumed_and_queued_signals() {
        let mut signals = TransferSignals::new(2);
        assert!(!signals.release(0));
        signals.signal(0);
        assert!(signals.release(0));
        assert!(signals.barrier(0, false).is_ok_and(|queued| !queued));

        signals.signal(1);
        signals.barrier(1, true).unwrap();
        assert!(signals.release(1));
        assert!(signals.take_waits().is_empty());
    }

    #[test]
    fn frame_versions_wrap() {
        let mut versions = FrameVersions::new(2).unwrap();
        assert_eq!(versions.select(5), 1);
        versions.resize(3).unwrap();
        assert_eq!(versions.select(5), 2);
        assert!(versions.resize(4).is_err());
        assert!(FrameVersions::new(0).is_err());
    }

    #[test]
    fn pass_grouping() {
        let groups = group_passes([false, true, true, false], true).unwrap();
        assert_eq!(groups, PassGroups { pre: 0..1, in_pass: 1..3, post: 3..4 });

        let groups = group_passes([false, false], true).unwrap();
        assert_eq!(groups, PassGroups { pre: 0..2, in_pass: 2..2, post: 2..2 });

        let groups = group_passes([true], true).unwrap();
        assert_eq!(groups, PassGroups { pre: 0..0, in_pass: 0..1, post: 1..1 });
    }

    #[test]
    fn standalone_between_pass_buffers_is_rejected() {
        let err = group_passes([true, false, true], true).unwrap_err();
        assert!(matches!(err, RhiError::ContractViolation(_)));
        assert!(group_passes([true, false, true], false).is_ok());
    }
}
