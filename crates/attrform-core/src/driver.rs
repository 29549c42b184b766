//! Async driver for a [`FormSession`].
//!
//! Executes [`Effect`]s: each resolution runs as a task on a [`JoinSet`],
//! cancellation aborts the task, and completions are fed back through
//! [`FormSession::apply`]. Sibling callbacks run concurrently. A response
//! that slips past an abort is still discarded by the generation check.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

use crate::descriptor::{AttributeContent, AttributeDescriptor};
use crate::error::{ResolutionError, SessionError};
use crate::resolver::CallbackResolver;
use crate::session::{Effect, FormEvent, FormSession, ResolutionTicket, Transition};
use crate::value::FieldValue;

struct Completion {
    ticket: ResolutionTicket,
    outcome: Result<Vec<AttributeContent>, ResolutionError>,
}

/// Owns a session and runs its callbacks.
pub struct FormDriver {
    session: FormSession,
    resolver: Arc<CallbackResolver>,
    tasks: JoinSet<Completion>,
    in_flight: HashMap<String, (u64, AbortHandle)>,
}

impl FormDriver {
    /// Wrap a mounted session and start the resolutions its mount requested.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(session: FormSession, mounted: Transition, resolver: Arc<CallbackResolver>) -> Self {
        let mut driver = Self {
            session,
            resolver,
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
        };
        driver.execute(mounted);
        driver
    }

    /// Mount a fresh form and start resolving.
    #[must_use]
    pub fn mount(
        scope: &str,
        descriptors: &[AttributeDescriptor],
        resolver: Arc<CallbackResolver>,
    ) -> Self {
        let (session, mounted) = FormSession::mount(scope, descriptors);
        Self::new(session, mounted, resolver)
    }

    #[must_use]
    pub fn session(&self) -> &FormSession {
        &self.session
    }

    /// Stop all in-flight work, drop the resolver's memo and hand back the
    /// session.
    pub async fn into_session(mut self) -> FormSession {
        self.tasks.abort_all();
        self.resolver.clear().await;
        self.session
    }

    /// Number of resolutions currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Apply an event and execute its effects.
    ///
    /// # Errors
    ///
    /// Propagates the session's [`SessionError`].
    pub fn apply(&mut self, event: FormEvent) -> Result<Transition, SessionError> {
        let transition = self.session.apply(event)?;
        self.execute(transition.clone());
        Ok(transition)
    }

    /// Set a field value.
    ///
    /// # Errors
    ///
    /// Propagates the session's [`SessionError`].
    pub fn set_value(&mut self, path: &str, value: Option<FieldValue>) -> Result<(), SessionError> {
        self.apply(FormEvent::ValueChanged {
            path: path.to_owned(),
            value,
        })
        .map(drop)
    }

    /// Retry a field in a resolution error.
    ///
    /// # Errors
    ///
    /// Propagates the session's [`SessionError`].
    pub fn retry(&mut self, path: &str) -> Result<(), SessionError> {
        self.apply(FormEvent::Retry {
            path: path.to_owned(),
        })
        .map(drop)
    }

    /// Run until no resolution is in flight, including the ones that
    /// completions start further down the chain.
    pub async fn settle(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            let Completion { ticket, outcome } = match joined {
                Ok(completion) => completion,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    warn!(error = %err, "resolution task failed");
                    continue;
                }
            };

            if self
                .in_flight
                .get(&ticket.path)
                .is_some_and(|(generation, _)| *generation == ticket.generation)
            {
                self.in_flight.remove(&ticket.path);
            }

            let event = match outcome {
                Ok(content) => FormEvent::ResolutionSucceeded { ticket, content },
                Err(error) => FormEvent::ResolutionFailed { ticket, error },
            };
            match self.session.apply(event) {
                Ok(transition) => self.execute(transition),
                Err(err) => warn!(error = %err, "completion rejected"),
            }
        }
    }

    fn execute(&mut self, transition: Transition) {
        for effect in transition.effects {
            match effect {
                Effect::Cancel { path } => {
                    if let Some((generation, handle)) = self.in_flight.remove(&path) {
                        debug!(field = %path, generation, "aborting resolution");
                        handle.abort();
                    }
                }
                Effect::Resolve(ticket) => {
                    let resolver = Arc::clone(&self.resolver);
                    let path = ticket.path.clone();
                    let generation = ticket.generation;
                    let handle = self.tasks.spawn(async move {
                        let outcome = resolver.resolve(&ticket.request, &ticket.key).await;
                        Completion { ticket, outcome }
                    });
                    if let Some((_, previous)) =
                        self.in_flight.insert(path, (generation, handle))
                    {
                        previous.abort();
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for FormDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormDriver")
            .field("session", &self.session)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
