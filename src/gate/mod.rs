//! Single-flight readiness gate for identity-provider client seeding.
//!
//! The gate owns the one piece of mutable shared state in this service: has
//! the client registry been seeded yet? A naive "already seeded?" boolean
//! read and written across await points races on a cold process, so the gate
//! keeps an explicit state machine behind a mutex that is never held across
//! an await. The `InProgress` state carries a `tokio::sync::watch` receiver
//! that every concurrent caller awaits, which is what makes the seeding
//! operation single-flight: one spawned task, one outcome, many waiters.
//!
//! The seeding task is spawned on the runtime rather than awaited inline, so
//! a caller whose request is cancelled mid-flight never cancels the shared
//! operation.

use crate::oidc::{store::ClientRegistryStore, ClientConfigSource};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

/// Why a seeding attempt failed.
///
/// Configuration errors are sticky for the process lifetime: the registry
/// file will not change underneath a running process, so re-reading it on
/// every request would only produce an unbounded stream of identical
/// failures. Store errors are transient and the next request re-attempts.
#[derive(Debug, Clone, Error)]
pub enum SeedError {
    /// Client registry configuration is missing or malformed.
    #[error("invalid identity-provider client configuration: {0}")]
    Configuration(String),

    /// The persistent store could not be reached or rejected the upsert.
    #[error("identity-provider client store unavailable: {0}")]
    Store(String),

    /// A seeding attempt vanished without reporting an outcome. This is a
    /// contract violation inside the gate, not a normal runtime error.
    #[error("seeding attempt was dropped before completing")]
    Gate,
}

impl SeedError {
    /// Whether the next `ensure_ready` call should start a fresh attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Gate)
    }
}

/// Coarse gate state, exposed for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Disabled,
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

impl GateStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

type Outcome = Option<Result<(), SeedError>>;

enum GateState {
    Disabled,
    NotStarted,
    InProgress {
        epoch: u64,
        outcome: watch::Receiver<Outcome>,
    },
    Ready,
    Failed(SeedError),
}

#[derive(Clone)]
struct Seeder {
    source: Arc<dyn ClientConfigSource>,
    store: Arc<dyn ClientRegistryStore>,
}

impl Seeder {
    async fn run(&self) -> Result<(), SeedError> {
        let clients = self
            .source
            .load()
            .await
            .map_err(|err| SeedError::Configuration(err.to_string()))?;

        info!(
            clients = clients.len(),
            "seeding identity-provider client registry"
        );

        self.store
            .upsert_all(&clients)
            .await
            .map_err(|err| SeedError::Store(err.to_string()))?;

        Ok(())
    }
}

/// Single-flight gate guarding the authentication endpoint.
///
/// Constructed once at startup and injected into the request dispatcher; the
/// dispatcher never mutates the state directly, every transition goes through
/// [`ReadinessGate::ensure_ready`].
pub struct ReadinessGate {
    state: Arc<Mutex<GateState>>,
    seeder: Option<Seeder>,
    epoch: AtomicU64,
}

impl ReadinessGate {
    #[must_use]
    pub fn new(source: Arc<dyn ClientConfigSource>, store: Arc<dyn ClientRegistryStore>) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::NotStarted)),
            seeder: Some(Seeder { source, store }),
            epoch: AtomicU64::new(0),
        }
    }

    /// Gate for a process with the identity-provider integration turned off.
    /// `ensure_ready` is a permanent no-op success and no collaborator is
    /// ever invoked.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::Disabled)),
            seeder: None,
            epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn status(&self) -> GateStatus {
        match &*self.state.lock() {
            GateState::Disabled => GateStatus::Disabled,
            GateState::NotStarted => GateStatus::NotStarted,
            GateState::InProgress { .. } => GateStatus::InProgress,
            GateState::Ready => GateStatus::Ready,
            GateState::Failed(_) => GateStatus::Failed,
        }
    }

    /// Ensure the client registry has been seeded, starting at most one
    /// seeding operation regardless of how many callers race here.
    ///
    /// Once a call has returned `Ok`, every later call returns `Ok` without
    /// touching the configuration source or the store again.
    ///
    /// # Errors
    ///
    /// Returns the failure of the seeding attempt this caller observed. A
    /// retryable failure ([`SeedError::is_retryable`]) resets the gate so the
    /// next call starts a fresh attempt; a configuration failure is returned
    /// verbatim for the rest of the process lifetime.
    pub async fn ensure_ready(&self) -> Result<(), SeedError> {
        let (attempt, mut outcome) = {
            let mut state = self.state.lock();
            match &*state {
                GateState::Disabled | GateState::Ready => return Ok(()),
                GateState::InProgress { epoch, outcome } => (*epoch, outcome.clone()),
                GateState::NotStarted => self.begin_attempt(&mut state),
                GateState::Failed(err) if err.is_retryable() => self.begin_attempt(&mut state),
                GateState::Failed(err) => return Err(err.clone()),
            }
        };

        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }

            // The sender only drops without sending if the seeding task was
            // lost, e.g. a panic inside a collaborator. Record the loss so
            // the next call starts a fresh attempt instead of waiting on a
            // dead channel forever.
            if outcome.changed().await.is_err() {
                fail_lost_attempt(&self.state, attempt);
                return Err(SeedError::Gate);
            }
        }
    }

    fn begin_attempt(&self, state: &mut GateState) -> (u64, watch::Receiver<Outcome>) {
        let Some(seeder) = self.seeder.clone() else {
            // Unreachable for gates built via `new`; a gate without a seeder
            // is a disabled gate and must stay one.
            *state = GateState::Disabled;
            let (_tx, rx) = watch::channel(Some(Ok(())));
            return (0, rx);
        };

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);

        *state = GateState::InProgress {
            epoch,
            outcome: rx.clone(),
        };

        let shared = Arc::clone(&self.state);

        tokio::spawn(async move {
            let result = seeder.run().await;
            finish_attempt(&shared, epoch, &result);
            let _ = tx.send(Some(result));
        });

        (epoch, rx)
    }
}

/// A seeding task only drops its outcome channel without sending when it
/// panicked. Transition the attempt to `Failed` so a later call can retry;
/// a state already owned by a newer attempt is left alone.
fn fail_lost_attempt(state: &Mutex<GateState>, epoch: u64) {
    let mut state = state.lock();

    let matches_attempt = matches!(
        &*state,
        GateState::InProgress { epoch: current, .. } if *current == epoch
    );

    if matches_attempt {
        error!(epoch, "seeding attempt was lost before reporting an outcome");
        *state = GateState::Failed(SeedError::Gate);
    }
}

/// Record the outcome of a seeding attempt, unless a newer attempt already
/// owns the state. Two attempts running at once would be a violation of the
/// single-flight contract, so a mismatched epoch is logged loudly and the
/// newer state is left alone.
fn finish_attempt(state: &Mutex<GateState>, epoch: u64, result: &Result<(), SeedError>) {
    let mut state = state.lock();

    let matches_attempt = matches!(
        &*state,
        GateState::InProgress { epoch: current, .. } if *current == epoch
    );

    if !matches_attempt {
        error!(epoch, "overlapping seeding attempts detected");
        return;
    }

    match result {
        Ok(()) => {
            info!("identity-provider client registry ready");
            *state = GateState::Ready;
        }
        Err(err) => {
            error!("seeding attempt failed: {err}");
            *state = GateState::Failed(err.clone());
        }
    }
}
