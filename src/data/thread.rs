use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INDEX: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static INDEX: u64 = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);
}

/// Small sequential number of the calling thread, assigned on first use.
pub fn thread_index() -> u64 {
    INDEX.with(|index| *index)
}
