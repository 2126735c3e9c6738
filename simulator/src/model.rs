use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Exec,
    Query,
    Transaction { fail: bool },
    Derive,
    BreakConn,
    FailNext,
    Sleep(u64),
}

/// Counters shared by every simulated task.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub(crate) ops: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) rollbacks: AtomicU64,
    pub(crate) violations: AtomicU64,
}

impl Tally {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub(crate) fn template(idx: usize) -> String {
    if idx % 2 == 0 {
        format!("UPDATE sim_{idx} SET v = ? WHERE id = ?")
    } else {
        format!("SELECT v FROM sim_{idx} WHERE id = ?")
    }
}
