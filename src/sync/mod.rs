///
/// Latest-value channel: the receiver only ever observes the most recent value.
///
pub mod watch;

///
/// Clonable one-shot stop signal.
///
pub mod stop;

pub use stop::{stop_signal, StopSignal, StopTrigger};
