pub(crate) mod debug_counters;
pub(crate) mod error;
