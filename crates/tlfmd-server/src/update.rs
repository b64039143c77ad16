//! Single-shot "a newer merged head exists" notifications.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tlfmd_core::{RequestContext, Revision, TlfId};
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};

/// Resolves once, when another session commits a merged revision past the
/// one the caller registered with.
#[derive(Debug)]
pub struct UpdateWaiter {
    rx: oneshot::Receiver<ServerResult<()>>,
    delivered: bool,
}

impl UpdateWaiter {
    fn new(rx: oneshot::Receiver<ServerResult<()>>) -> Self {
        Self { rx, delivered: false }
    }

    /// Wait for the notification or for the request to end.
    pub async fn wait(mut self, ctx: &RequestContext) -> ServerResult<()> {
        tokio::select! {
            res = &mut self.rx => res.unwrap_or(Err(ServerError::RegistrationCancelled)),
            err = ctx.done() => Err(ServerError::Context(err)),
        }
    }

    /// Non-blocking poll. `Some` at most once.
    pub fn try_take(&mut self) -> Option<ServerResult<()>> {
        if self.delivered {
            return None;
        }
        match self.rx.try_recv() {
            Ok(res) => {
                self.delivered = true;
                Some(res)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.delivered = true;
                Some(Err(ServerError::RegistrationCancelled))
            }
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }
}

#[derive(Default)]
pub(crate) struct UpdateManager {
    observers: HashMap<TlfId, HashMap<Uuid, oneshot::Sender<ServerResult<()>>>>,
    /// Session that wrote the current merged head of each folder.
    session_heads: HashMap<TlfId, Uuid>,
}

impl UpdateManager {
    pub fn register(
        &mut self,
        tlf: TlfId,
        curr_head: Revision,
        merged_head: Revision,
        session: Uuid,
    ) -> UpdateWaiter {
        let (tx, rx) = oneshot::channel();
        let waiter = UpdateWaiter::new(rx);

        if merged_head > curr_head && self.session_heads.get(&tlf) != Some(&session) {
            let _ = tx.send(Ok(()));
            return waiter;
        }

        let observers = self.observers.entry(tlf).or_default();
        if observers.contains_key(&session) {
            let _ = tx.send(Err(ServerError::DuplicateRegistration { tlf }));
            return waiter;
        }
        observers.insert(session, tx);
        waiter
    }

    /// Record `session` as the writer of the new merged head and fire every
    /// other session's observer.
    pub fn set_head(&mut self, tlf: TlfId, session: Uuid) {
        self.session_heads.insert(tlf, session);
        if let Some(observers) = self.observers.get_mut(&tlf) {
            let fired: Vec<Uuid> = observers.keys().filter(|s| **s != session).copied().collect();
            for s in fired {
                if let Some(tx) = observers.remove(&s) {
                    let _ = tx.send(Ok(()));
                }
            }
            if observers.is_empty() {
                self.observers.remove(&tlf);
            }
        }
    }

    pub fn cancel(&mut self, tlf: TlfId, session: Uuid) {
        if let Some(observers) = self.observers.get_mut(&tlf) {
            observers.remove(&session);
            if observers.is_empty() {
                self.observers.remove(&tlf);
            }
        }
    }

    /// Drop every pending observer; their waiters see a cancellation.
    pub fn clear(&mut self) {
        self.observers.clear();
    }
}
