/// Sub-operation counters of a download task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u32,
    pub failed: u32,
    pub remaining: u32,
    /// Last computed percentage, kept when the total drops to zero
    pub percent: u32,
}

impl Progress {
    pub fn new(completed: u32, failed: u32, remaining: u32) -> Self {
        let mut p = Progress::default();
        p.update(completed, failed, remaining);
        p
    }

    pub fn total(&self) -> u32 {
        self.completed + self.failed + self.remaining
    }

    pub fn update(&mut self, completed: u32, failed: u32, remaining: u32) {
        self.completed = completed;
        self.failed = failed;
        self.remaining = remaining;
        let total = self.total();
        if total > 0 {
            self.percent = ((u64::from(completed) * 100) / u64::from(total)) as u32;
        }
    }

    /// Sum of several task counters
    pub fn aggregate(items: impl IntoIterator<Item = Progress>) -> Progress {
        let (c, f, r) = items.into_iter().fold((0, 0, 0), |(c, f, r), p| {
            (c + p.completed, f + p.failed, r + p.remaining)
        });
        Progress::new(c, f, r)
    }
}
