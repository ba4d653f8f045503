//! Background timers: garbage collection of idle entries, observer staleness
//! and refetch intervals.

pub(crate) mod timeout;
