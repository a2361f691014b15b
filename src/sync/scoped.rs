//! Run an operation with deferred cleanups that always execute.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use crate::error::{CacheError, Result};

type Cleanup = Box<dyn FnOnce() -> color_eyre::Result<()> + Send>;

/// Handle passed to a scoped operation for registering cleanups.
#[derive(Clone, Default)]
pub struct Scope {
  cleanups: Arc<Mutex<Vec<Cleanup>>>,
}

impl Scope {
  /// Register a cleanup. Cleanups run in reverse registration order once the
  /// operation finishes, whatever the outcome.
  pub fn defer<F>(&self, cleanup: F)
  where
    F: FnOnce() -> color_eyre::Result<()> + Send + 'static,
  {
    self
      .cleanups
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Box::new(cleanup));
  }

  fn run_cleanups(&self) {
    let cleanups = std::mem::take(
      &mut *self
        .cleanups
        .lock()
        .unwrap_or_else(PoisonError::into_inner),
    );

    for (index, cleanup) in cleanups.into_iter().enumerate().rev() {
      match std::panic::catch_unwind(AssertUnwindSafe(cleanup)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(index, error = %e, "Deferred cleanup failed"),
        Err(panic) => warn!(index, panic = %panic_message(&*panic), "Deferred cleanup panicked"),
      }
    }
  }
}

/// Runs the scope's cleanups when dropped, which also covers the outer future
/// being cancelled mid-operation.
struct CleanupGuard(Scope);

impl Drop for CleanupGuard {
  fn drop(&mut self) {
    self.0.run_cleanups();
  }
}

/// Execute `op` and run every cleanup it deferred before returning.
///
/// Never panics: a panic inside `op` becomes [`CacheError::Panicked`]. Cleanup
/// failures are logged and do not change the returned outcome.
pub async fn run_scoped<T, F, Fut>(op: F) -> Result<T>
where
  F: FnOnce(Scope) -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let scope = Scope::default();
  let guard = CleanupGuard(scope.clone());

  let outcome = AssertUnwindSafe(async move { op(scope).await })
    .catch_unwind()
    .await;
  drop(guard);

  match outcome {
    Ok(result) => result,
    Err(panic) => Err(CacheError::Panicked(panic_message(&*panic))),
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let push = {
      let log = log.clone();
      move |entry| log.lock().unwrap().push(entry)
    };
    (log, push)
  }

  #[tokio::test]
  async fn test_cleanups_run_in_reverse_order() {
    let (log, push) = recorder();

    let result = run_scoped(|scope| {
      let push = push.clone();
      async move {
        for name in ["first", "second", "third"] {
          let push = push.clone();
          scope.defer(move || {
            push(name);
            Ok(())
          });
        }
        push("body");
        Ok(7)
      }
    })
    .await;

    assert_eq!(result, Ok(7));
    assert_eq!(*log.lock().unwrap(), vec!["body", "third", "second", "first"]);
  }

  #[tokio::test]
  async fn test_error_still_runs_cleanups() {
    let (log, push) = recorder();

    let result: Result<()> = run_scoped(|scope| async move {
      scope.defer(move || {
        push("cleanup");
        Ok(())
      });
      Err(CacheError::FetchFailed("boom".into()))
    })
    .await;

    assert_eq!(result, Err(CacheError::FetchFailed("boom".into())));
    assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
  }

  fn explode() -> Result<()> {
    panic!("bootstrap exploded")
  }

  #[tokio::test]
  async fn test_panic_becomes_failure() {
    let (log, push) = recorder();

    let result: Result<()> = run_scoped(|scope| async move {
      scope.defer(move || {
        push("cleanup");
        Ok(())
      });
      explode()
    })
    .await;

    assert_eq!(result, Err(CacheError::Panicked("bootstrap exploded".into())));
    assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
  }

  #[tokio::test]
  async fn test_failing_cleanup_is_swallowed() {
    let (log, push) = recorder();

    let result = run_scoped(|scope| async move {
      let after = push.clone();
      scope.defer(move || {
        after("outer");
        Ok(())
      });
      scope.defer(|| Err(eyre!("close failed")));
      scope.defer(|| panic!("cleanup panicked"));
      Ok("done")
    })
    .await;

    assert_eq!(result, Ok("done"));
    assert_eq!(*log.lock().unwrap(), vec!["outer"]);
  }

  #[tokio::test]
  async fn test_cancelled_operation_runs_cleanups() {
    let (log, push) = recorder();

    let op = run_scoped(|scope| async move {
      scope.defer(move || {
        push("cleanup");
        Ok(())
      });
      std::future::pending::<Result<()>>().await
    });
    let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), op).await;

    assert!(timed_out.is_err());
    assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
  }
}
