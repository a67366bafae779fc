//! Subscriber callbacks.
//!
//! A [`Callback`] is a cheap, cloneable handle around an [`EventHandler`].
//! Registries key callbacks by handle identity: clones of one handle are the
//! same subscriber, two handles built from identical closures are not.

use crate::error::CallbackError;
use crate::message::Message;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Event handler trait for processing messages.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a message delivered on a subscribed topic.
    async fn handle(&self, message: Message) -> Result<(), CallbackError>;
}

/// Identity handle for a subscribed handler.
#[derive(Clone)]
pub struct Callback(Arc<dyn EventHandler>);

impl Callback {
    /// Wrap a handler.
    pub fn new<H: EventHandler + 'static>(handler: H) -> Self {
        Self(Arc::new(handler))
    }

    /// Wrap an already shared handler. Clones of the same `Arc` share identity.
    pub fn from_arc(handler: Arc<dyn EventHandler>) -> Self {
        Self(handler)
    }

    /// Build a callback from a synchronous closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Message) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Self::new(FnHandler(f))
    }

    /// Build a callback from a closure returning a future.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        Self::new(AsyncFnHandler {
            f,
            _future: PhantomData,
        })
    }

    /// Invoke the handler.
    pub async fn invoke(&self, message: Message) -> Result<(), CallbackError> {
        self.0.handle(message).await
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Callback {}

impl Hash for Callback {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback")
            .field(&format_args!("{:#x}", self.addr()))
            .finish()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Message) -> Result<(), CallbackError> + Send + Sync,
{
    async fn handle(&self, message: Message) -> Result<(), CallbackError> {
        (self.0)(message)
    }
}

struct AsyncFnHandler<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> EventHandler for AsyncFnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), CallbackError> {
        (self.f)(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_identity_not_equality() {
        let a = Callback::from_fn(|_| Ok(()));
        let b = Callback::from_fn(|_| Ok(()));

        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let set: HashSet<Callback> = [a.clone(), a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_from_arc_shares_identity() {
        struct Noop;

        #[async_trait]
        impl EventHandler for Noop {
            async fn handle(&self, _message: Message) -> Result<(), CallbackError> {
                Ok(())
            }
        }

        let shared: Arc<dyn EventHandler> = Arc::new(Noop);
        assert_eq!(Callback::from_arc(shared.clone()), Callback::from_arc(shared));
    }

    #[tokio::test]
    async fn test_invoke_sync_and_async() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sync = Callback::from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let counter = calls.clone();
        let asynchronous = Callback::from_async(move |message: Message| {
            let counter = counter.clone();
            async move {
                if message.payload() == &json!("fail") {
                    return Err(CallbackError::new("refused"));
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        sync.invoke(Message::new("t", json!(1))).await.unwrap();
        asynchronous.invoke(Message::new("t", json!(1))).await.unwrap();
        assert!(asynchronous.invoke(Message::new("t", json!("fail"))).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
