//! # Queue redeclaration on worker (re)start.
//!
//! Auto-deletion of a queue can take its bindings and exchanges with it, so
//! when any configured queue is found missing, *everything* the admin knows
//! is redeclared. Declarations are idempotent; aside from some network
//! chatter this is free, and it only happens when a queue is actually gone.
//!
//! With `mismatched_queues_fatal` the declarations are always attempted, so
//! a worker restart fails fast with a fatal startup error when arguments
//! conflict.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::broker::Admin;
use crate::error::{BrokerError, ConsumerError};

/// Extension hook invoked after a successful redeclaration pass.
pub type RedeclareHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct Redeclarer {
    admin: Option<Arc<dyn Admin>>,
    mismatched_queues_fatal: bool,
    on_redeclare: Option<RedeclareHook>,
}

impl Redeclarer {
    pub(crate) fn new(
        admin: Option<Arc<dyn Admin>>,
        mismatched_queues_fatal: bool,
        on_redeclare: Option<RedeclareHook>,
    ) -> Self {
        Self {
            admin,
            mismatched_queues_fatal,
            on_redeclare,
        }
    }

    pub(crate) fn has_admin(&self) -> bool {
        self.admin.is_some()
    }

    /// Redeclares broker entities if a configured queue is missing.
    ///
    /// Mismatched-argument failures become fatal startup errors; other
    /// admin failures are logged and ignored (the consumer's own passive
    /// declarations will surface real unavailability).
    pub(crate) async fn redeclare_if_necessary(
        &self,
        queue_names: &[String],
    ) -> Result<(), ConsumerError> {
        let Some(admin) = &self.admin else {
            return Ok(());
        };
        if self.mismatched_queues_fatal {
            return self.initialize(admin).await;
        }
        for queue in queue_names {
            match admin.queue_properties(queue).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(queue = %queue, "queue missing; redeclaring exchanges, queues, bindings");
                    return self.initialize(admin).await;
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "failed to check/redeclare queue");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn initialize(&self, admin: &Arc<dyn Admin>) -> Result<(), ConsumerError> {
        match admin.initialize().await {
            Ok(()) => {
                if let Some(hook) = &self.on_redeclare {
                    hook();
                }
                Ok(())
            }
            Err(BrokerError::MismatchedQueueArgs { queue }) => Err(ConsumerError::FatalStartup {
                reason: format!("mismatched queue arguments for '{queue}'"),
            }),
            Err(BrokerError::ConnectionRefused { .. }) => {
                info!("broker not available; cannot redeclare queues");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to redeclare broker entities");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn missing_queue_triggers_initialize() {
        let broker = MemoryBroker::new();
        let admin = broker.admin(vec!["q1".into(), "q2".into()]);
        let hook_calls = Arc::new(AtomicU32::new(0));
        let hook_calls_clone = Arc::clone(&hook_calls);
        let redeclarer = Redeclarer::new(
            Some(admin),
            false,
            Some(Arc::new(move || {
                hook_calls_clone.fetch_add(1, Ordering::Relaxed);
            })),
        );

        redeclarer
            .redeclare_if_necessary(&["q1".into(), "q2".into()])
            .await
            .unwrap();
        assert!(broker.has_queue("q1") && broker.has_queue("q2"));
        assert_eq!(hook_calls.load(Ordering::Relaxed), 1);

        // Everything present: no further initialize.
        redeclarer
            .redeclare_if_necessary(&["q1".into(), "q2".into()])
            .await
            .unwrap();
        assert_eq!(hook_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn mismatched_args_become_fatal_startup() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.set_mismatched_args("q", true);
        let redeclarer = Redeclarer::new(Some(broker.admin(vec!["q".into()])), true, None);
        let err = redeclarer
            .redeclare_if_necessary(&["q".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::FatalStartup { .. }));
    }

    #[tokio::test]
    async fn no_admin_is_a_noop() {
        let redeclarer = Redeclarer::new(None, true, None);
        assert!(!redeclarer.has_admin());
        redeclarer
            .redeclare_if_necessary(&["q".into()])
            .await
            .unwrap();
    }
}
