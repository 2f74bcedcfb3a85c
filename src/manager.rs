//! Tracking of dispatched requests on behalf of a display target.
//!
//! A target (say, one image slot in a list) owns at most one live request.
//! Redispatching to the same target while a request is running is a restart:
//! the caller keeps the same [`Disposable`] identity while the underlying
//! job is swapped out, so a handle held from the first dispatch still
//! controls the latest one. Disposing cancels the current job immediately;
//! clearing the target itself is deferred until the owner drains it, which
//! keeps teardown out of result-delivery paths.

use crate::control::CancelToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One dispatched execution: the token that cancels it.
#[derive(Debug, Clone)]
pub struct JobHandle {
  token: CancelToken,
}

impl JobHandle {
  pub fn new(token: CancelToken) -> Self {
    Self { token }
  }

  pub fn token(&self) -> &CancelToken {
    &self.token
  }
}

#[derive(Debug)]
struct DisposableInner {
  job: Mutex<JobHandle>,
  disposed: AtomicBool,
}

/// Handle to a live request. Cloning shares identity: all clones observe the
/// same job and the same disposed flag.
#[derive(Debug, Clone)]
pub struct Disposable {
  inner: Arc<DisposableInner>,
}

impl Disposable {
  fn new(job: JobHandle) -> Self {
    Self {
      inner: Arc::new(DisposableInner {
        job: Mutex::new(job),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.load(Ordering::SeqCst)
  }

  /// The currently attached job; after a restart this is the newest one.
  pub fn job(&self) -> JobHandle {
    self.inner.job.lock().unwrap().clone()
  }

  /// Cancel the current job and mark this handle dead. Idempotent.
  pub fn dispose(&self) {
    if !self.inner.disposed.swap(true, Ordering::SeqCst) {
      self.inner.job.lock().unwrap().token().cancel();
    }
  }

  fn swap_job(&self, job: JobHandle) {
    *self.inner.job.lock().unwrap() = job;
  }

  fn same_identity(&self, other: &Disposable) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

#[derive(Debug, Default)]
struct ManagerState {
  current: Option<Disposable>,
  pending_clear: bool,
}

/// Per-target request bookkeeping.
#[derive(Debug, Default)]
pub struct RequestManager {
  state: Mutex<ManagerState>,
}

impl RequestManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Attach a freshly dispatched job. When a live request is already
  /// attached this is a restart: the old job is cancelled and the existing
  /// disposable is reused so outstanding handles follow the new job.
  pub fn attach(&self, job: JobHandle) -> Disposable {
    let mut state = self.state.lock().unwrap();
    if let Some(current) = &state.current {
      if !current.is_disposed() {
        current.job().token().cancel();
        current.swap_job(job);
        return current.clone();
      }
    }
    let disposable = Disposable::new(job);
    state.current = Some(disposable.clone());
    state.pending_clear = false;
    disposable
  }

  /// Whether `disposable` is still the one attached to this target. A handle
  /// kept across a restart stays current; a handle from before a full
  /// detach does not.
  pub fn is_current(&self, disposable: &Disposable) -> bool {
    let state = self.state.lock().unwrap();
    match &state.current {
      Some(current) => current.same_identity(disposable) && !current.is_disposed(),
      None => false,
    }
  }

  /// Dispose the attached request, if any. The job is cancelled now; the
  /// target clear is recorded and performed later via
  /// [`drain_pending_clear`](RequestManager::drain_pending_clear).
  pub fn dispose(&self) {
    let mut state = self.state.lock().unwrap();
    if let Some(current) = state.current.take() {
      if !current.is_disposed() {
        current.dispose();
        state.pending_clear = true;
      }
    }
  }

  /// Take the deferred clear, if one is pending. Returns `true` exactly once
  /// per dispose.
  pub fn drain_pending_clear(&self) -> bool {
    let mut state = self.state.lock().unwrap();
    std::mem::take(&mut state.pending_clear)
  }
}
