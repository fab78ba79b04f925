//! Message handlers.
//!
//! A handler receives the [`RequestContext`] of the delivery and the decoded
//! [`Envelope`], and returns `Ok(())` on success. Any `Err`, panic or timeout is
//! a handler failure and engages the consumer's retry policy.
//!
//! Three shapes are supported:
//!
//! - Any async closure `Fn(RequestContext, Envelope) -> impl Future<Output = anyhow::Result<()>>`
//! - [`typed`]: the payload is converted into `T` before the closure runs
//! - [`blocking`]: a synchronous, CPU-bound closure run on the blocking pool
//!
//! # Example
//!
//! ```
//! use courier_core::context::RequestContext;
//! use courier_core::event::DomainEvent;
//! use courier_core::handler::{typed, MessageHandler};
//!
//! async fn on_order_created(_ctx: RequestContext, event: DomainEvent) -> anyhow::Result<()> {
//!     assert_eq!(event.event_name(), "OrderCreated");
//!     Ok(())
//! }
//!
//! let handler = typed(on_order_created);
//! # fn assert_handler<H: MessageHandler>(_: &H) {}
//! # assert_handler(&handler);
//! ```

use crate::context::RequestContext;
use crate::envelope::Envelope;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by [`MessageHandler::handle`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Something that can process a delivered message.
///
/// The returned future must be `'static` because the consumer runs it as its
/// own task so that it can be abandoned on timeout.
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    fn handle(&self, ctx: RequestContext, envelope: Envelope) -> HandlerFuture;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(RequestContext, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: RequestContext, envelope: Envelope) -> HandlerFuture {
        Box::pin(self(ctx, envelope))
    }
}

/// Handler adapter that converts the payload into `T` first.
///
/// Created by [`typed`].
pub struct Typed<T, F> {
    f: F,
    _message: PhantomData<fn() -> T>,
}

/// Wrap an async closure taking a typed message.
///
/// A payload that does not convert into `T` fails the delivery.
/// The conversion error counts as a handler failure: `f` is not called and
/// the delivery takes the retry path like any other error.
#[must_use]
pub const fn typed<T, F, Fut>(f: F) -> Typed<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(RequestContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Typed {
        f,
        _message: PhantomData,
    }
}

impl<T, F, Fut> MessageHandler for Typed<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(RequestContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: RequestContext, envelope: Envelope) -> HandlerFuture {
        match envelope.decode::<T>() {
            Ok(message) => Box::pin((self.f)(ctx, message)),
            Err(e) => Box::pin(async move { Err(e.into()) }),
        }
    }
}

/// Handler adapter for synchronous closures.
///
/// Created by [`blocking`].
pub struct Blocking<T, F> {
    f: Arc<F>,
    _message: PhantomData<fn() -> T>,
}

/// Wrap a synchronous closure so it runs on tokio's blocking pool.
///
/// Blocking handlers cannot be interrupted: on timeout the dispatcher stops
/// waiting but the closure runs to completion in the background.
#[must_use]
pub fn blocking<T, F>(f: F) -> Blocking<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(RequestContext, T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Blocking {
        f: Arc::new(f),
        _message: PhantomData,
    }
}

impl<T, F> MessageHandler for Blocking<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(RequestContext, T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, ctx: RequestContext, envelope: Envelope) -> HandlerFuture {
        let f = Arc::clone(&self.f);
        Box::pin(async move {
            let message = envelope.decode::<T>()?;
            tokio::task::spawn_blocking(move || f(ctx, message))
                .await
                .map_err(|e| anyhow::anyhow!("blocking handler did not complete: {e}"))?
        })
    }
}

/// Fully-qualified identity of a handler function, used for work-queue naming.
///
/// Expands to `"<module path>::<name>"`.
///
/// ```
/// use courier_core::handler_name;
///
/// fn on_order_created() {}
///
/// assert!(handler_name!(on_order_created).ends_with("::on_order_created"));
/// ```
#[macro_export]
macro_rules! handler_name {
    ($handler:ident) => {
        concat!(module_path!(), "::", stringify!($handler))
    };
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::event::DomainEvent;
    use serde_json::json;

    fn event_envelope() -> Envelope {
        Envelope::new(json!({
            "event_name": "OrderCreated",
            "occur_on": "2025-01-01T00:00:00Z",
            "order_id": 1
        }))
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |_ctx: RequestContext, envelope: Envelope| async move {
            anyhow::ensure!(envelope.payload["order_id"] == json!(1), "wrong order");
            Ok(())
        };

        handler
            .handle(RequestContext::new(), event_envelope())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn typed_handler_receives_decoded_event() {
        let handler = typed(|_ctx: RequestContext, event: DomainEvent| async move {
            anyhow::ensure!(event.get("order_id") == Some(&json!(1)), "wrong order");
            Ok(())
        });

        handler
            .handle(RequestContext::new(), event_envelope())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn typed_handler_fails_on_unconvertible_payload() {
        let handler = typed(|_ctx: RequestContext, _event: DomainEvent| async move { Ok(()) });

        let result = handler
            .handle(RequestContext::new(), Envelope::new(json!("not an event")))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn blocking_handler_runs_to_completion() {
        let handler = blocking(|_ctx: RequestContext, value: u32| {
            anyhow::ensure!(value == 5, "unexpected value");
            Ok(())
        });

        handler
            .handle(RequestContext::new(), Envelope::new(json!(5)))
            .await
            .unwrap();
        assert!(
            handler
                .handle(RequestContext::new(), Envelope::new(json!(6)))
                .await
                .is_err()
        );
    }

    #[test]
    fn handler_name_includes_module_path() {
        fn on_paid() {}
        on_paid();

        assert_eq!(
            handler_name!(on_paid),
            concat!(module_path!(), "::", "on_paid")
        );
    }
}
