//! Message-local storage.
//!
//! Every delivery is processed inside its own task-local type-map. Handlers, failure hooks
//! and anything they call can stash data there without threading it through arguments:
//! a correlation id picked up deep in a call stack, a timer started before a slow call,
//! extra context to attach to the closing log record.
//!
//! The map lives as long as the processing of the delivery, including the execution of
//! the [`BrokerAction`](crate::consumers::BrokerAction) chosen for it.
#![allow(clippy::declare_interior_mutable_const)] // silence tokio::task_local warning

use std::cell::RefCell;
use std::future::Future;
use task_local_extensions::Extensions;

tokio::task_local! {
    // Behind a RefCell to allow inserts through a shared reference.
    static EXTENSIONS: RefCell<Extensions>;
}

/// Run `fut` with `extensions` as its message-local storage, then hand back whatever
/// the storage holds once it completes.
pub(crate) async fn with_extensions<T>(
    extensions: Extensions,
    fut: impl Future<Output = T>,
) -> (Extensions, T) {
    EXTENSIONS
        .scope(RefCell::new(extensions), async move {
            let output = fut.await;
            let extensions = RefCell::new(Extensions::new());
            EXTENSIONS.with(|ext| ext.swap(&extensions));
            (extensions.into_inner(), output)
        })
        .await
}

/// Retrieve an item from message-local storage based on its type.
///
/// `None` outside of message processing or if no item of that type was stored.
pub fn get_message_local_item<T: Send + Sync + Clone + 'static>() -> Option<T> {
    EXTENSIONS
        .try_with(|e| e.borrow().get::<T>().cloned())
        .ok()
        .flatten()
}

/// Insert an item in message-local storage, replacing any item of the same type.
///
/// Outside of message processing the item is dropped and a warning is logged.
pub fn set_message_local_item<T: Send + Sync + 'static>(item: T) {
    if EXTENSIONS
        .try_with(|e| e.borrow_mut().insert(item))
        .is_err()
    {
        tracing::warn!("Message-local storage is only available while a message is processed");
    }
}
