pub(crate) mod alloc;
pub(crate) mod bins;
pub(crate) mod block;
pub(crate) mod list;
pub(crate) mod os;
pub(crate) mod stats;

// Serialises tests that assert on the process-wide gauges in `stats`.
// Gauge-reading tests take the write lock; everything else takes read.
#[cfg(test)]
pub(crate) static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
