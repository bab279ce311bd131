//! Boolean settings. Each toggle becomes its own operation so the caller can
//! apply them one at a time.

use crate::batch::{groups, Operation};
use crate::model::Toggles;

/// `(group, on value, off value, current value)` for every toggle.
fn settings(t: &Toggles) -> [(&'static str, &'static str, &'static str, bool); 4] {
    [
        (groups::STARTUP_VIEW, "headless", "window", t.start_headless),
        (groups::ACCELERATION, "on", "off", t.passthrough_acceleration),
        (groups::PAUSE_IDLE, "on", "off", t.pause_when_idle),
        (groups::AUTOSTART, "on", "off", t.autostart_on_host),
    ]
}

/// Every toggle whose desired value differs from the observed one.
pub fn diff_toggles(desired: &Toggles, observed: &Toggles) -> Vec<Operation> {
    settings(desired)
        .into_iter()
        .zip(settings(observed))
        .filter(|(want, have)| want.3 != have.3)
        .map(|((group, on, off, enabled), _)| Operation::set(group, if enabled { on } else { off }))
        .collect()
}

/// Toggles to switch on for a freshly provisioned machine.
///
/// Only `true` values are applied; a new machine already sits at baseline.
pub fn creation_toggles(desired: &Toggles, observed: &Toggles) -> Vec<Operation> {
    settings(desired)
        .into_iter()
        .zip(settings(observed))
        .filter(|(want, have)| want.3 && !have.3)
        .map(|((group, on, _, _), _)| Operation::set(group, on))
        .collect()
}
