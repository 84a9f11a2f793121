//! Build coalescing.
//!
//! Triggers that arrive while a build runs do not queue: they flag the build as
//! pending and wait on the in-flight future. When the running build settles
//! with the flag set, one more build starts immediately and every waiter
//! receives the outcome of that latest build.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// Future shared by every caller waiting on the same build.
pub type SharedBuild<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

enum Phase<T, E>
where
    T: Clone,
    E: Clone,
{
    Idle,
    InFlight(SharedBuild<T, E>),
    InFlightWithPending(SharedBuild<T, E>),
}

/// Collapses overlapping build triggers into at most one trailing rebuild.
pub struct BuildCoalescer<T, E>
where
    T: Clone,
    E: Clone,
{
    phase: Arc<Mutex<Phase<T, E>>>,
}

impl<T, E> BuildCoalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<tokio::task::JoinError> + 'static,
{
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(Phase::Idle)),
        }
    }

    /// Whether a build is currently running.
    pub fn is_building(&self) -> bool {
        !matches!(*self.phase.lock(), Phase::Idle)
    }

    /// Start a build, or join the one in flight and request a rerun after it.
    ///
    /// The build runs on its own task, so dropping every returned future does
    /// not abandon it.
    pub fn trigger<F, Fut>(&self, build: F) -> SharedBuild<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut phase = self.phase.lock();
        if let Phase::InFlight(shared) | Phase::InFlightWithPending(shared) = &*phase {
            let shared = shared.clone();
            *phase = Phase::InFlightWithPending(shared.clone());
            return shared;
        }

        let state = self.phase.clone();
        let handle = tokio::spawn(async move {
            loop {
                let result = build().await;
                let mut phase = state.lock();
                match std::mem::replace(&mut *phase, Phase::Idle) {
                    Phase::InFlightWithPending(shared) => *phase = Phase::InFlight(shared),
                    _ => return result,
                }
            }
        });

        let reset = self.phase.clone();
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => {
                    *reset.lock() = Phase::Idle;
                    Err(E::from(err))
                }
            }
        }
        .boxed()
        .shared();

        *phase = Phase::InFlight(shared.clone());
        shared
    }
}

impl<T, E> Default for BuildCoalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<tokio::task::JoinError> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
