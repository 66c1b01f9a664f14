use std::sync::Arc;

/// Receives `(percent, bytes since the previous call)`.
pub type ProgressFn = Arc<dyn Fn(u8, u64) + Send + Sync>;

/// Byte counter that reports at most once per whole percentage point and
/// holds 100 back for [`ProgressMeter::finish`].
pub(crate) struct ProgressMeter {
    total: u64,
    done: u64,
    pending: u64,
    last_percent: u8,
    callback: ProgressFn,
}

impl ProgressMeter {
    pub(crate) fn new(total: u64, callback: ProgressFn) -> Self {
        Self {
            total,
            done: 0,
            pending: 0,
            last_percent: 0,
            callback,
        }
    }

    /// Starts from bytes already accounted for by an earlier run.
    pub(crate) fn resumed(mut self, done: u64) -> Self {
        self.done = done.min(self.total);
        self.last_percent = self.percent();
        self
    }

    pub(crate) fn done(&self) -> u64 {
        self.done
    }

    pub(crate) fn advance(&mut self, bytes: u64) {
        let room = self.total.saturating_sub(self.done);
        let bytes = bytes.min(room);
        self.done += bytes;
        self.pending += bytes;
        let percent = self.percent();
        if percent > self.last_percent {
            self.last_percent = percent;
            (self.callback)(percent, std::mem::take(&mut self.pending));
        }
    }

    pub(crate) fn finish(&mut self) {
        self.last_percent = 100;
        (self.callback)(100, std::mem::take(&mut self.pending));
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.done as u128 * 100 / self.total as u128) as u8).min(99)
    }
}
