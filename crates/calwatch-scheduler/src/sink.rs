//! Notification sink interface.

use crate::{ArmSummary, Diagnostic, Transition};

/// Receiver of scheduler notifications.
///
/// Called without any scheduler lock held, so implementations may call back
/// into the scheduler (for example to force a re-arm).
pub trait TransitionSink: Send + Sync + 'static {
    /// An armed edge fired.
    fn on_transition(&self, transition: &Transition);

    /// An arming pass completed. Carries what status text is built from.
    fn on_rearmed(&self, _summary: &ArmSummary) {}

    /// A recoverable condition was absorbed.
    fn on_diagnostic(&self, _diagnostic: &Diagnostic) {}
}
