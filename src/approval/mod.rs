//! Approval arbitration
//!
//! One interface, two habitats: at a terminal the question is asked inline
//! and answered on the next line; behind the server it becomes an
//! `approval_required` event on the session stream and a one-shot future
//! resolved by a later HTTP call.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::server::ServerEvent;

#[async_trait]
pub trait ApprovalArbiter: Send + Sync {
    /// Ask for permission to run a tool call. `call_id`, when present, is
    /// used as the correlation identifier so out-of-band answers can find
    /// the question.
    async fn request_approval(
        &self,
        tool_name: &str,
        args_json: &str,
        call_id: Option<&str>,
        cancel: CancellationToken,
    ) -> bool;
}

/// Interactive terminal prompt. Approves only an explicit `y`.
pub struct TerminalApprover;

#[async_trait]
impl ApprovalArbiter for TerminalApprover {
    async fn request_approval(
        &self,
        tool_name: &str,
        args_json: &str,
        _call_id: Option<&str>,
        cancel: CancellationToken,
    ) -> bool {
        println!("\n[approval] {tool_name} {args_json}");
        println!("Allow this call? [y/N]");

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        tokio::select! {
            _ = cancel.cancelled() => false,
            read = reader.read_line(&mut line) => match read {
                Ok(_) => line.trim().eq_ignore_ascii_case("y"),
                Err(_) => false,
            },
        }
    }
}

/// Refuses everything. Used where no arbiter is wired up and as a safe
/// default in tests.
pub struct AutoDeny;

#[async_trait]
impl ApprovalArbiter for AutoDeny {
    async fn request_approval(
        &self,
        _tool_name: &str,
        _args_json: &str,
        _call_id: Option<&str>,
        _cancel: CancellationToken,
    ) -> bool {
        false
    }
}

/// Server-side arbitration: each request parks a one-shot sender keyed by
/// its correlation id and emits an `approval_required` event; the approvals
/// endpoint completes it. Cancellation resolves to denial.
pub struct PendingApprovals {
    events: mpsc::UnboundedSender<ServerEvent>,
    pending: DashMap<String, oneshot::Sender<bool>>,
}

impl PendingApprovals {
    pub fn new(events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            events,
            pending: DashMap::new(),
        }
    }

    /// Complete a pending approval. Returns false when no question with
    /// this id is waiting (already answered, cancelled, or never asked).
    pub fn try_resolve(&self, call_id: &str, approved: bool) -> bool {
        match self.pending.remove(call_id) {
            Some((_, sender)) => sender.send(approved).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ApprovalArbiter for PendingApprovals {
    async fn request_approval(
        &self,
        tool_name: &str,
        args_json: &str,
        call_id: Option<&str>,
        cancel: CancellationToken,
    ) -> bool {
        let id = call_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id.clone(), sender);

        let sent = self.events.send(ServerEvent::ApprovalRequired {
            call_id: id.clone(),
            tool: tool_name.to_string(),
            args: args_json.to_string(),
            reason: format!("{tool_name} requires approval"),
        });
        if sent.is_err() {
            // Nobody can ever answer; fail closed.
            self.pending.remove(&id);
            return false;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.remove(&id);
                false
            }
            answer = receiver => answer.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn resolution_completes_the_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let approvals = Arc::new(PendingApprovals::new(tx));

        let pending = approvals.clone();
        let ask = tokio::spawn(async move {
            pending
                .request_approval("RunCommand", "{}", Some("c1"), CancellationToken::new())
                .await
        });

        // The approval_required event must surface before resolution works.
        let event = rx.recv().await.unwrap();
        match event {
            ServerEvent::ApprovalRequired { call_id, tool, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(tool, "RunCommand");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(approvals.try_resolve("c1", true));
        assert!(ask.await.unwrap());
        assert_eq!(approvals.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolve_is_single_shot() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let approvals = Arc::new(PendingApprovals::new(tx));

        let pending = approvals.clone();
        let ask = tokio::spawn(async move {
            pending
                .request_approval("ApplyPatch", "{}", Some("c2"), CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(approvals.try_resolve("c2", false));
        assert!(!approvals.try_resolve("c2", true));
        assert!(!ask.await.unwrap());
    }

    #[tokio::test]
    async fn unknown_call_id_does_not_resolve() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let approvals = PendingApprovals::new(tx);
        assert!(!approvals.try_resolve("missing", true));
    }

    #[tokio::test]
    async fn cancellation_denies() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let approvals = Arc::new(PendingApprovals::new(tx));
        let cancel = CancellationToken::new();

        let pending = approvals.clone();
        let token = cancel.clone();
        let ask = tokio::spawn(async move {
            pending
                .request_approval("RunCommand", "{}", Some("c3"), token)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(!ask.await.unwrap());
        assert_eq!(approvals.pending_count(), 0);
    }
}
