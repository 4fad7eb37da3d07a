//! Single-fire "session became active" notification.
//!
//! Work that needs a session id (part uploads, finalize, abort) registers
//! here while creation is in flight.  When the id arrives every queued
//! action runs exactly once, in registration order.  Actions registered
//! after activation run immediately on the caller's thread.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::storage::client::SessionId;

type Action = Box<dyn FnOnce(&SessionId) + Send>;

enum State {
    /// Creation in flight.
    Pending(Vec<Action>),
    /// The queue is being drained; late registrants go to `late`.
    Firing { id: SessionId, late: Vec<Action> },
    Active(SessionId),
    /// Creation failed; queued actions were dropped unrun.
    Failed,
}

pub struct Activation {
    state: Mutex<State>,
}

impl Default for Activation {
    fn default() -> Self {
        Self::new()
    }
}

impl Activation {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `action` once the session is active.
    ///
    /// Returns `false` (dropping the action) if creation already failed.
    pub fn on_active<F>(&self, action: F) -> bool
    where
        F: FnOnce(&SessionId) + Send + 'static,
    {
        let mut state = self.lock();
        match &mut *state {
            State::Pending(queue) => {
                queue.push(Box::new(action));
                true
            }
            State::Firing { late, .. } => {
                late.push(Box::new(action));
                true
            }
            State::Active(id) => {
                let id = id.clone();
                drop(state);
                action(&id);
                true
            }
            State::Failed => false,
        }
    }

    /// Record the session id and fire every queued action in order.
    ///
    /// Returns how many queued actions ran.  Only the first call has any
    /// effect.
    pub fn activate(&self, id: SessionId) -> usize {
        let mut batch = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(queue) => {
                    let queue = mem::take(queue);
                    *state = State::Firing {
                        id: id.clone(),
                        late: Vec::new(),
                    };
                    queue
                }
                _ => return 0,
            }
        };

        let mut fired = 0;
        loop {
            for action in batch.drain(..) {
                action(&id);
                fired += 1;
            }

            let mut state = self.lock();
            match &mut *state {
                State::Firing { late, .. } if !late.is_empty() => {
                    batch = mem::take(late);
                }
                _ => {
                    *state = State::Active(id.clone());
                    return fired;
                }
            }
        }
    }

    /// Mark creation as failed, dropping every queued action unrun.
    pub fn fail(&self) -> usize {
        let mut state = self.lock();
        match mem::replace(&mut *state, State::Failed) {
            State::Pending(queue) => queue.len(),
            // Activation already happened; keep it.
            other => {
                *state = other;
                0
            }
        }
    }

    /// The session id, once known.
    pub fn session_id(&self) -> Option<SessionId> {
        match &*self.lock() {
            State::Firing { id, .. } | State::Active(id) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Action) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> Action {
                let log = Arc::clone(&log);
                Box::new(move |id: &SessionId| {
                    log.lock().unwrap().push(format!("{name}:{id}"));
                })
            }
        };
        (log, make)
    }

    #[test]
    fn test_queued_actions_fire_once_in_order() {
        let activation = Activation::new();
        let (log, make) = recorder();

        activation.on_active(make("upload-1"));
        activation.on_active(make("abort"));
        activation.on_active(make("upload-2"));
        assert!(log.lock().unwrap().is_empty());
        assert!(!activation.is_active());

        assert_eq!(activation.activate(SessionId::new("s1")), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["upload-1:s1", "abort:s1", "upload-2:s1"]
        );

        // A second activation is ignored and nothing fires twice.
        assert_eq!(activation.activate(SessionId::new("s2")), 0);
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(activation.session_id(), Some(SessionId::new("s1")));
    }

    #[test]
    fn test_registration_after_activation_runs_immediately() {
        let activation = Activation::new();
        let (log, make) = recorder();

        activation.activate(SessionId::new("s1"));
        assert!(activation.on_active(make("complete")));
        assert_eq!(*log.lock().unwrap(), vec!["complete:s1"]);
    }

    #[test]
    fn test_registration_while_firing_keeps_order() {
        let activation = Arc::new(Activation::new());
        let (log, make) = recorder();

        let nested = {
            let activation = Arc::clone(&activation);
            let second = make("second");
            let log = Arc::clone(&log);
            move |id: &SessionId| {
                log.lock().unwrap().push(format!("first:{id}"));
                activation.on_active(second);
            }
        };
        activation.on_active(nested);
        activation.on_active(make("third"));

        assert_eq!(activation.activate(SessionId::new("s1")), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:s1", "third:s1", "second:s1"]
        );
    }

    #[test]
    fn test_fail_drops_queued_actions() {
        let activation = Activation::new();
        let (log, make) = recorder();

        activation.on_active(make("upload-1"));
        assert_eq!(activation.fail(), 1);
        assert!(!activation.on_active(make("late")));
        assert_eq!(activation.activate(SessionId::new("s1")), 0);
        assert!(log.lock().unwrap().is_empty());
        assert!(activation.session_id().is_none());
    }

    #[test]
    fn test_fail_after_activation_is_ignored() {
        let activation = Activation::new();
        activation.activate(SessionId::new("s1"));
        assert_eq!(activation.fail(), 0);
        assert!(activation.is_active());
    }
}
