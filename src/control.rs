//! Cooperative cancellation for in-flight requests.
//!
//! Every pipeline stage checks its token at entry and before any I/O.
//! Cancellation is cooperative: a stage already past its last check completes
//! and its result is discarded by the consumer rather than interrupted.
//!
//! Tokens are explicit values threaded through the pipeline; there is no
//! ambient thread-local state in the engine core.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pipeline stage names, used in cancellation and depth errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  MemoryLookup,
  Fetch,
  Decode,
  Transform,
  Resize,
  CacheWrite,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::MemoryLookup => "memory lookup",
      Stage::Fetch => "fetch",
      Stage::Decode => "decode",
      Stage::Transform => "transform",
      Stage::Resize => "resize",
      Stage::CacheWrite => "cache write",
    };
    f.write_str(name)
  }
}

/// Shared cancellation flag for one request execution.
///
/// Cloning is cheap; all clones observe the same flag. Cancelling stops
/// further pipeline progression at the next stage check.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  cancelled: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Request cancellation. Idempotent.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  /// Returns `Err(Error::Cancelled)` if cancellation was requested.
  pub fn check(&self, stage: Stage) -> Result<()> {
    if self.is_cancelled() {
      Err(Error::Cancelled { stage })
    } else {
      Ok(())
    }
  }

}
