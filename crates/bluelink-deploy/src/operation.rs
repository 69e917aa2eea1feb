use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluelink_domain::{ChangesetId, ChannelId, InstanceId};
use tokio_util::sync::CancellationToken;

use crate::error::DeployError;

/// The in-flight mutation slot for an instance.
#[derive(Debug, Clone)]
pub enum OperationKind {
    Deploy { changeset_id: ChangesetId },
    Destroy,
}

impl OperationKind {
    fn name(&self) -> &'static str {
        match self {
            OperationKind::Deploy { .. } => "deploy",
            OperationKind::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActiveOperation {
    pub kind: OperationKind,
    pub channel: ChannelId,
    pub cancel: CancellationToken,
}

/// At-most-one mutating operation per instance.
///
/// Deliberately in-memory only: a crashed process must not deadlock its own
/// instance, and the reconciliation engine's interrupted classification
/// covers state left behind by a crash.
#[derive(Clone, Default)]
pub struct OperationTokens {
    slots: Arc<Mutex<HashMap<InstanceId, ActiveOperation>>>,
}

impl OperationTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for an instance, failing with `instance-busy` when an
    /// operation is already in flight.
    pub fn begin(
        &self,
        instance_id: InstanceId,
        kind: OperationKind,
        channel: ChannelId,
    ) -> Result<OperationGuard, DeployError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = slots.get(&instance_id) {
            return Err(DeployError::InstanceBusy {
                instance_id,
                operation: active.kind.name().to_string(),
            });
        }
        let cancel = CancellationToken::new();
        slots.insert(
            instance_id,
            ActiveOperation {
                kind,
                channel,
                cancel: cancel.clone(),
            },
        );
        Ok(OperationGuard {
            slots: Arc::clone(&self.slots),
            instance_id,
            cancel,
        })
    }

    /// Inspect the in-flight operation, if any.
    pub fn active(&self, instance_id: InstanceId) -> Option<ActiveOperation> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&instance_id).cloned()
    }

    /// Preempt a running operation. Returns false when nothing is in flight.
    pub fn cancel(&self, instance_id: InstanceId) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(&instance_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Releases the operation slot on drop.
#[derive(Debug)]
pub struct OperationGuard {
    slots: Arc<Mutex<HashMap<InstanceId, ActiveOperation>>>,
    instance_id: InstanceId,
    pub cancel: CancellationToken,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_operation_is_rejected_while_first_holds_the_slot() {
        let tokens = OperationTokens::new();
        let instance_id = InstanceId::generate();
        let changeset_id = ChangesetId::generate();

        let guard = tokens
            .begin(
                instance_id,
                OperationKind::Deploy { changeset_id },
                ChannelId::new("op-1"),
            )
            .unwrap();

        let err = tokens
            .begin(instance_id, OperationKind::Destroy, ChannelId::new("op-2"))
            .unwrap_err();
        assert!(matches!(err, DeployError::InstanceBusy { .. }));

        drop(guard);
        tokens
            .begin(instance_id, OperationKind::Destroy, ChannelId::new("op-3"))
            .unwrap();
    }

    #[test]
    fn cancel_preempts_through_the_token() {
        let tokens = OperationTokens::new();
        let instance_id = InstanceId::generate();

        let guard = tokens
            .begin(instance_id, OperationKind::Destroy, ChannelId::new("op"))
            .unwrap();
        assert!(!guard.cancel.is_cancelled());

        assert!(tokens.cancel(instance_id));
        assert!(guard.cancel.is_cancelled());
        assert!(!tokens.cancel(InstanceId::generate()));
    }

    #[test]
    fn active_reports_the_operation_kind() {
        let tokens = OperationTokens::new();
        let instance_id = InstanceId::generate();
        assert!(tokens.active(instance_id).is_none());

        let _guard = tokens
            .begin(instance_id, OperationKind::Destroy, ChannelId::new("op"))
            .unwrap();
        let active = tokens.active(instance_id).unwrap();
        assert!(matches!(active.kind, OperationKind::Destroy));
    }
}
