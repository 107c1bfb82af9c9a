use std::sync::atomic::{AtomicUsize, Ordering};

static ID: AtomicUsize = AtomicUsize::new(1);

pub(crate) fn next() -> usize {
    ID.fetch_add(1, Ordering::SeqCst)
}
