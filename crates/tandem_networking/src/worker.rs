//! Worker-loop plumbing shared by the barrier and sync data components.

use crate::error::NetResult;
use std::thread;
use tandem_core::{Backoff, WorkerFlag};
use tandem_shared::BackoffSpec;

/// Builds a [`Backoff`] from a configured schedule.
pub(crate) fn backoff(spec: BackoffSpec) -> Backoff {
    Backoff::new(spec.min_ms, spec.max_ms, spec.ratio)
}

/// Starts a detached, named worker thread.
///
/// Workers are never joined. `flag` reports running from this call on and
/// the body adopts it with [`WorkerFlag::adopt`]; shutdown polls it instead.
pub(crate) fn spawn(name: String, flag: &WorkerFlag, body: impl FnOnce() + Send + 'static) -> NetResult<()> {
    flag.set_running(true);
    if let Err(e) = thread::Builder::new().name(name).spawn(body) {
        flag.set_running(false);
        return Err(e.into());
    }
    Ok(())
}

/// Sleeps on `spec` until every flag reports stopped.
pub(crate) fn wait_stopped(flags: &[&WorkerFlag], spec: BackoffSpec) {
    let mut schedule = backoff(spec);
    while flags.iter().any(|flag| flag.is_running()) {
        schedule.sleep();
    }
}
