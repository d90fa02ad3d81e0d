use crate::types::{Beat, Chunk, DecodedSample};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Opaque value supplied with a registration and handed back on every call
///
/// Tokens let one observer serve several subscriptions and select which of
/// them to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Token(pub u64);

impl From<u64> for Token {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Removal criterion, either a wildcard or one exact value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<T> {
    /// Matches everything
    Any,
    /// Matches only this value
    Exact(T),
}

impl Selector<Token> {
    fn matches(&self, token: Token) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => *expected == token,
        }
    }
}

/// Receives samples decoded from the device stream
///
/// Called on the acquisition task, synchronously and in registration order.
/// Implementations should return quickly: no further data is read until every
/// observer has returned.
pub trait SampleObserver: Send + Sync {
    /// A heart-rate reading was decoded
    fn on_sample(&self, source: &str, sample: &DecodedSample, token: Token);

    /// A checksum-verified chunk of ECG/accelerometer blocks was decoded
    fn on_chunk(&self, source: &str, chunk: &Chunk, token: Token) {
        let _ = (source, chunk, token);
    }
}

impl<F> SampleObserver for F
where
    F: Fn(&str, &DecodedSample, Token) + Send + Sync,
{
    fn on_sample(&self, source: &str, sample: &DecodedSample, token: Token) {
        self(source, sample, token);
    }
}

/// Receives beats from a beat detector
pub trait BeatObserver: Send + Sync {
    /// A beat was detected
    fn on_beat(&self, source: &str, beat: &Beat, token: Token);
}

impl<F> BeatObserver for F
where
    F: Fn(&str, &Beat, Token) + Send + Sync,
{
    fn on_beat(&self, source: &str, beat: &Beat, token: Token) {
        self(source, beat, token);
    }
}

/// One live registration
pub struct Subscription<O: ?Sized> {
    /// Registered observer
    pub observer: Arc<O>,
    /// Token given at registration
    pub token: Token,
}

impl<O: ?Sized> Clone for Subscription<O> {
    fn clone(&self) -> Self {
        Self {
            observer: Arc::clone(&self.observer),
            token: self.token,
        }
    }
}

impl<O: ?Sized> fmt::Debug for Subscription<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("observer", &Arc::as_ptr(&self.observer).cast::<()>())
            .field("token", &self.token)
            .finish()
    }
}

/// Ordered list of observer registrations
///
/// Observers are identified by the allocation behind their `Arc`. The same
/// observer and token may be registered more than once; each registration
/// fires independently.
pub struct Registry<O: ?Sized> {
    subscriptions: Vec<Subscription<O>>,
}

impl<O: ?Sized> Default for Registry<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: ?Sized> fmt::Debug for Registry<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.subscriptions).finish()
    }
}

impl<O: ?Sized> Registry<O> {
    /// Create an empty registry
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }

    /// Append a registration
    pub fn add(&mut self, observer: Arc<O>, token: Token) {
        self.subscriptions.push(Subscription { observer, token });
    }

    /// Remove every registration matching both selectors
    ///
    /// Returns the number of registrations removed.
    pub fn remove(&mut self, observer: Selector<&Arc<O>>, token: Selector<Token>) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| {
            let same_observer = match observer {
                Selector::Any => true,
                Selector::Exact(target) => {
                    std::ptr::addr_eq(Arc::as_ptr(&sub.observer), Arc::as_ptr(target))
                }
            };
            !(same_observer && token.matches(sub.token))
        });
        before - self.subscriptions.len()
    }

    /// Number of registrations
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Copy of the registrations in registration order
    ///
    /// Dispatch iterates a snapshot so observers may (un)register while being
    /// called.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscription<O>> {
        self.subscriptions.clone()
    }
}
