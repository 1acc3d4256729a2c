// Metric macro wrappers so the crate builds without the telemetry feature.
#[cfg(feature = "telemetry")]
#[allow(unused_macros)]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        metrics::counter!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
#[allow(unused_macros)]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        $crate::macros::NoopCounter
    };
}

#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
pub(crate) struct NoopCounter;

#[cfg(not(feature = "telemetry"))]
impl NoopCounter {
    pub(crate) fn increment(&self, _value: u64) {}
}
