//! Turning functions into message handlers.
//!
//! Any `async fn` (or closure returning a future) whose parameters all implement
//! [`FromDispatchContext`] is a [`Handler`]. Synchronous functions are wrapped with
//! [`sync_handler`].
//!
//! The return type decides, once, how the value is turned into a [`BrokerAction`]:
//!
//! | Return type                  | [`ResultAdapter`]                      |
//! |------------------------------|----------------------------------------|
//! | `()`                         | [`ResultAdapter::Void`]                |
//! | `BrokerAction`               | [`ResultAdapter::Direct`]              |
//! | `Result<(), E>`              | [`ResultAdapter::Awaitable`]           |
//! | `Result<BrokerAction, E>`    | [`ResultAdapter::AwaitableOfResult`]   |
use crate::consumers::binding::{ArgumentBinding, FromDispatchContext};
use crate::consumers::{BindError, BrokerAction, DispatchContext};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// How the value returned by a handler becomes a [`BrokerAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAdapter {
    /// Nothing to adapt: the delivery is acked once the handler returns.
    Void,
    /// The handler picked the action itself.
    Direct,
    /// Ack on `Ok`, process failure hook on `Err`.
    Awaitable,
    /// The action on `Ok`, process failure hook on `Err`.
    AwaitableOfResult,
}

/// What came out of a handler invocation, before failure hooks are involved.
#[derive(Debug)]
pub enum HandlerOutcome {
    Completed,
    Action(BrokerAction),
    Failed(anyhow::Error),
}

/// A value a handler can return.
pub trait HandlerOutput: Send + 'static {
    const ADAPTER: ResultAdapter;

    fn into_outcome(self) -> HandlerOutcome;
}

impl HandlerOutput for () {
    const ADAPTER: ResultAdapter = ResultAdapter::Void;

    fn into_outcome(self) -> HandlerOutcome {
        HandlerOutcome::Completed
    }
}

impl HandlerOutput for BrokerAction {
    const ADAPTER: ResultAdapter = ResultAdapter::Direct;

    fn into_outcome(self) -> HandlerOutcome {
        HandlerOutcome::Action(self)
    }
}

impl<E> HandlerOutput for Result<(), E>
where
    E: Into<anyhow::Error> + Send + 'static,
{
    const ADAPTER: ResultAdapter = ResultAdapter::Awaitable;

    fn into_outcome(self) -> HandlerOutcome {
        match self {
            Ok(()) => HandlerOutcome::Completed,
            Err(e) => HandlerOutcome::Failed(e.into()),
        }
    }
}

impl<E> HandlerOutput for Result<BrokerAction, E>
where
    E: Into<anyhow::Error> + Send + 'static,
{
    const ADAPTER: ResultAdapter = ResultAdapter::AwaitableOfResult;

    fn into_outcome(self) -> HandlerOutcome {
        match self {
            Ok(action) => HandlerOutcome::Action(action),
            Err(e) => HandlerOutcome::Failed(e.into()),
        }
    }
}

/// A function that can process deliveries.
///
/// `Args` is the tuple of parameter types: it only exists to tell implementations apart
/// and never has to be spelled out.
pub trait Handler<Args>: Clone + Send + Sync + 'static {
    type Output: HandlerOutput;

    /// Where each parameter comes from, in declaration order.
    fn parameters() -> Vec<ArgumentBinding>;

    /// Extract the arguments from `context` and invoke the handler.
    ///
    /// Synchronous handlers run to completion inside `call`.
    fn call(
        &self,
        context: &Arc<DispatchContext>,
    ) -> Result<BoxFuture<'static, Self::Output>, BindError>;
}

/// Marker for the parameters of a [`SyncHandler`].
pub struct SyncArgs<Args>(PhantomData<fn() -> Args>);

/// A synchronous function used as a handler, see [`sync_handler`].
#[derive(Clone)]
pub struct SyncHandler<F>(F);

/// Use a synchronous function as a handler.
///
/// ```rust
/// use carrot_dispatch::consumers::{sync_handler, Dispatcher, Message, ResultAdapter};
///
/// fn audit(message: Message<Vec<u32>>) {
///     println!("{} entries", message.len());
/// }
///
/// let dispatcher = Dispatcher::new(sync_handler(audit)).unwrap();
/// assert_eq!(dispatcher.adapter(), ResultAdapter::Void);
/// ```
pub fn sync_handler<F>(f: F) -> SyncHandler<F> {
    SyncHandler(f)
}

macro_rules! impl_handler {
    ($($ty:ident $arg:ident),*) => {
        impl<F, Fut, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future + Send + 'static,
            Fut::Output: HandlerOutput,
            $($ty: FromDispatchContext,)*
        {
            type Output = Fut::Output;

            fn parameters() -> Vec<ArgumentBinding> {
                vec![$($ty::binding()),*]
            }

            #[allow(unused_variables)]
            fn call(
                &self,
                context: &Arc<DispatchContext>,
            ) -> Result<BoxFuture<'static, Self::Output>, BindError> {
                $(let $arg = $ty::from_context(context)?;)*
                Ok(Box::pin((self)($($arg),*)))
            }
        }

        impl<F, R, $($ty,)*> Handler<SyncArgs<($($ty,)*)>> for SyncHandler<F>
        where
            F: Fn($($ty),*) -> R + Clone + Send + Sync + 'static,
            R: HandlerOutput,
            $($ty: FromDispatchContext,)*
        {
            type Output = R;

            fn parameters() -> Vec<ArgumentBinding> {
                vec![$($ty::binding()),*]
            }

            #[allow(unused_variables)]
            fn call(
                &self,
                context: &Arc<DispatchContext>,
            ) -> Result<BoxFuture<'static, Self::Output>, BindError> {
                $(let $arg = $ty::from_context(context)?;)*
                let output = (self.0)($($arg),*);
                Ok(Box::pin(futures_util::future::ready(output)))
            }
        }
    };
}

impl_handler!();
impl_handler!(T1 a1);
impl_handler!(T1 a1, T2 a2);
impl_handler!(T1 a1, T2 a2, T3 a3);
impl_handler!(T1 a1, T2 a2, T3 a3, T4 a4);
impl_handler!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5);
impl_handler!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6);
impl_handler!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6, T7 a7);
impl_handler!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6, T7 a7, T8 a8);
impl_handler!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6, T7 a7, T8 a8, T9 a9);
impl_handler!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6, T7 a7, T8 a8, T9 a9, T10 a10);
