//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `pdftocairo` and
/// `tesseract` processes.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core.
///
/// You don't need to do this for in-process CPU-bound tasks, as long as you're
/// using
/// [`crate::async_utils::blocking_iter_streams::spawn_blocking_propagating_panics`].
/// But you should use it for expensive external processes.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("could not acquire CPU permit")?;
    trace!(available = CPU_SEMAPHORE.available_permits(), "acquired CPU permit");
    let result = f().await;
    drop(permit);
    result
}
