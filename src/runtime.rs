//! Runtime support: task spawning, background-worker lifetimes, the
//! TCP/TLS stream wrapper, and name resolution.

mod join_handle;
pub(crate) mod resolver;
pub(crate) mod stream;
#[cfg(feature = "rustls-tls")]
pub(crate) mod tls;

use std::future::Future;

pub(crate) use self::join_handle::AsyncJoinHandle;

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Best-effort extraction of a recovered panic's message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
