pub mod close;
pub mod notify;
pub mod reconcile;
pub mod triggers;

#[cfg(test)]
pub(crate) mod testutil;

pub use close::{cancelled_close, compute_close};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use reconcile::{ReconciliationWorker, StatusHandle, SweepStats};
pub use triggers::{evaluate_trigger, TpSlMonitor, TriggerStats};
