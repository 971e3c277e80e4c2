//! In-process signaling relay
//!
//! [`LocalRelay`] is a room hub for services living in the same process
//! (demos, tests). Directed envelopes go to their recipient, broadcasts go
//! to everybody but the sender. Each registered service has its own inbox
//! task, so envelopes reach a given service in the order they were sent.

use crate::identity::ParticipantId;
use crate::service::{CallService, WeakCallService};
use crate::signaling::{Envelope, SignalingError, SignalingSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Member {
    inbox: mpsc::UnboundedSender<Envelope>,
    task: tokio::task::JoinHandle<()>,
}

/// Room hub delivering envelopes between in-process services
#[derive(Default)]
pub struct LocalRelay {
    members: Mutex<HashMap<ParticipantId, Member>>,
    routed: AtomicU64,
}

impl LocalRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver envelopes addressed to `service` from now on
    ///
    /// Registering the same participant again replaces the previous inbox.
    pub fn register(&self, service: &CallService) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let weak: WeakCallService = service.downgrade();
        let participant = service.self_id().clone();

        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.handle_envelope(envelope).await;
            }
        });

        if let Some(old) = self.members.lock().insert(
            participant.clone(),
            Member {
                inbox: tx,
                task,
            },
        ) {
            old.task.abort();
        }
        tracing::debug!(participant = %participant, "Registered with local relay");
    }

    /// Stop delivering to `participant`
    pub fn unregister(&self, participant: &ParticipantId) -> bool {
        match self.members.lock().remove(participant) {
            Some(member) => {
                member.task.abort();
                true
            }
            None => false,
        }
    }

    /// Registered participants
    pub fn members(&self) -> Vec<ParticipantId> {
        let mut members: Vec<_> = self.members.lock().keys().cloned().collect();
        members.sort();
        members
    }

    /// Number of deliveries made so far
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    fn deliver(&self, to: &ParticipantId, member: &Member, envelope: Envelope) {
        if member.inbox.send(envelope).is_ok() {
            self.routed.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::debug!(participant = %to, "Inbox closed, dropping envelope");
        }
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        for (_, member) in self.members.get_mut().drain() {
            member.task.abort();
        }
    }
}

#[async_trait]
impl SignalingSink for LocalRelay {
    async fn send_envelope(&self, envelope: Envelope) -> Result<(), SignalingError> {
        let members = self.members.lock();
        match &envelope.to {
            Some(to) => match members.get(to) {
                Some(member) => self.deliver(to, member, envelope.clone()),
                None => tracing::debug!(to = %to, kind = %envelope.kind, "No such participant, dropping envelope"),
            },
            None => {
                for (id, member) in members.iter().filter(|(id, _)| **id != envelope.from) {
                    self.deliver(id, member, envelope.clone());
                }
            }
        }
        Ok(())
    }
}
