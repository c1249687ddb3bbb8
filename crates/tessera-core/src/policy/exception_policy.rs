use super::continuation::Continuation;
use crate::error::{find_apply_error, is_transient_error, ApplyEventError};
use std::any::{type_name, TypeId};
use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

type ErrorPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Delays used by the built-in policy for connectivity errors
pub const TRANSIENT_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// How long the built-in policy pauses a shard once retries are exhausted
pub const TRANSIENT_PAUSE: Duration = Duration::from_secs(30);

/// One rule: which errors it handles and the ordered responses to them
#[derive(Clone)]
pub struct ExceptionPolicy {
    description: String,
    matcher: ErrorPredicate,
    inner_matcher: Option<ErrorPredicate>,
    continuations: Vec<Continuation>,
    scoped_to_apply: bool,
}

impl ExceptionPolicy {
    fn for_type<E: StdError + 'static>() -> Self {
        Self {
            description: type_name::<E>().to_string(),
            matcher: Arc::new(|err: &(dyn StdError + 'static)| err.downcast_ref::<E>().is_some()),
            inner_matcher: None,
            continuations: Vec::new(),
            scoped_to_apply: TypeId::of::<E>() == TypeId::of::<ApplyEventError>(),
        }
    }

    fn transient_default() -> Self {
        let mut continuations: Vec<Continuation> = TRANSIENT_RETRY_DELAYS
            .iter()
            .map(|d| Continuation::RetryLater(*d))
            .collect();
        continuations.push(Continuation::PauseShard(TRANSIENT_PAUSE));

        Self {
            description: "transient connectivity error".to_string(),
            matcher: Arc::new(|err: &(dyn StdError + 'static)| is_transient_error(err)),
            inner_matcher: None,
            continuations,
            scoped_to_apply: false,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn continuations(&self) -> &[Continuation] {
        &self.continuations
    }

    /// Whether this policy was registered for [`ApplyEventError`] itself
    pub fn is_scoped_to_apply_errors(&self) -> bool {
        self.scoped_to_apply
    }

    /// Outer match plus, when configured, a match on the direct source.
    ///
    /// Policies not scoped to [`ApplyEventError`] also look through that
    /// wrapper so a rule for the underlying error still applies.
    pub fn matches(&self, err: &(dyn StdError + 'static)) -> bool {
        if self.matches_exactly(err) {
            return true;
        }
        if self.scoped_to_apply {
            return false;
        }
        match err.downcast_ref::<ApplyEventError>() {
            Some(apply) => self.matches_exactly(apply.source.as_ref()),
            None => false,
        }
    }

    fn matches_exactly(&self, err: &(dyn StdError + 'static)) -> bool {
        if !(self.matcher)(err) {
            return false;
        }
        match &self.inner_matcher {
            None => true,
            Some(inner) => err.source().map(|source| inner(source)).unwrap_or(false),
        }
    }

    /// Continuation for the given attempt. Not cyclic: running off the end
    /// of the list always isolates the shard.
    pub fn continuation_for(&self, attempts: usize) -> Continuation {
        self.continuations
            .get(attempts)
            .copied()
            .unwrap_or(Continuation::StopShard)
    }
}

impl fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("description", &self.description)
            .field("has_inner_matcher", &self.inner_matcher.is_some())
            .field("continuations", &self.continuations)
            .finish()
    }
}

/// Result of classifying an error against the configured policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMatch {
    /// Index into the registered policies
    Configured(usize),
    TransientDefault,
    Unhandled,
}

/// Ordered set of exception policies. First match wins.
///
/// ```
/// use tessera_core::policy::ExceptionPolicies;
/// use std::time::Duration;
///
/// let mut policies = ExceptionPolicies::default();
/// policies
///     .on_error::<std::num::ParseIntError>()
///     .retry_later(Duration::from_millis(50))
///     .retry_later(Duration::from_millis(50))
///     .pause(Duration::from_secs(10));
/// policies.on_apply_error().skip_event();
/// ```
#[derive(Clone)]
pub struct ExceptionPolicies {
    policies: Vec<ExceptionPolicy>,
    transient_default: ExceptionPolicy,
}

impl Default for ExceptionPolicies {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            transient_default: ExceptionPolicy::transient_default(),
        }
    }
}

impl fmt::Debug for ExceptionPolicies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.policies.iter()).finish()
    }
}

impl ExceptionPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy for errors of type `E`
    pub fn on_error<E: StdError + 'static>(&mut self) -> PolicyBuilder<'_, E> {
        self.policies.push(ExceptionPolicy::for_type::<E>());
        let idx = self.policies.len() - 1;
        PolicyBuilder {
            policy: &mut self.policies[idx],
            _marker: PhantomData,
        }
    }

    /// Register a policy scoped to event-application failures. Only such a
    /// policy can yield `SkipEvent`.
    pub fn on_apply_error(&mut self) -> PolicyBuilder<'_, ApplyEventError> {
        self.on_error::<ApplyEventError>()
    }

    pub fn policies(&self) -> &[ExceptionPolicy] {
        &self.policies
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn classify(&self, err: &(dyn StdError + 'static)) -> PolicyMatch {
        if let Some(idx) = self.policies.iter().position(|p| p.matches(err)) {
            return PolicyMatch::Configured(idx);
        }
        if self.transient_default.matches(err) {
            return PolicyMatch::TransientDefault;
        }
        PolicyMatch::Unhandled
    }

    /// Decide what to do about `err`, given `attempts` prior consecutive
    /// failures at the same position.
    pub fn determine_continuation(
        &self,
        err: &(dyn StdError + 'static),
        attempts: usize,
    ) -> Continuation {
        let policy = match self.classify(err) {
            PolicyMatch::Configured(idx) => &self.policies[idx],
            PolicyMatch::TransientDefault => &self.transient_default,
            PolicyMatch::Unhandled => return Continuation::StopShard,
        };

        match policy.continuation_for(attempts) {
            Continuation::SkipEvent
                if !policy.scoped_to_apply || find_apply_error(err).is_none() =>
            {
                Continuation::StopShard
            }
            continuation => continuation,
        }
    }
}

/// Fluent builder returned by [`ExceptionPolicies::on_error`]
pub struct PolicyBuilder<'a, E> {
    policy: &'a mut ExceptionPolicy,
    _marker: PhantomData<fn(&E)>,
}

impl<'a, E: StdError + 'static> PolicyBuilder<'a, E> {
    /// Narrow the match with a predicate over the typed error
    pub fn when<F>(self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.policy.matcher = Arc::new(move |err: &(dyn StdError + 'static)| {
            err.downcast_ref::<E>().map(&predicate).unwrap_or(false)
        });
        self
    }

    /// Additionally require the direct source to be an `I`
    pub fn with_inner<I: StdError + 'static>(self) -> Self {
        self.policy.inner_matcher = Some(Arc::new(|err: &(dyn StdError + 'static)| {
            err.downcast_ref::<I>().is_some()
        }));
        self.policy.description = format!("{} (inner {})", type_name::<E>(), type_name::<I>());
        self
    }

    /// Additionally require the direct source to be an `I` accepted by `predicate`
    pub fn with_inner_when<I, F>(self, predicate: F) -> Self
    where
        I: StdError + 'static,
        F: Fn(&I) -> bool + Send + Sync + 'static,
    {
        self.policy.inner_matcher = Some(Arc::new(move |err: &(dyn StdError + 'static)| {
            err.downcast_ref::<I>().map(&predicate).unwrap_or(false)
        }));
        self.policy.description = format!("{} (inner {})", type_name::<E>(), type_name::<I>());
        self
    }

    pub fn retry_later(self, delay: Duration) -> Self {
        self.then(Continuation::RetryLater(delay))
    }

    pub fn retry_later_many(self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.policy
            .continuations
            .extend(delays.into_iter().map(Continuation::RetryLater));
        self
    }

    pub fn skip_event(self) -> Self {
        self.then(Continuation::SkipEvent)
    }

    pub fn pause(self, delay: Duration) -> Self {
        self.then(Continuation::PauseShard(delay))
    }

    pub fn pause_projection(self, delay: Duration) -> Self {
        self.then(Continuation::PauseProjection(delay))
    }

    pub fn pause_all(self, delay: Duration) -> Self {
        self.then(Continuation::PauseAllProjections(delay))
    }

    pub fn stop_shard(self) -> Self {
        self.then(Continuation::StopShard)
    }

    pub fn stop_projection(self) -> Self {
        self.then(Continuation::StopProjection)
    }

    pub fn stop_all(self) -> Self {
        self.then(Continuation::StopAllProjections)
    }

    /// Append an arbitrary continuation
    pub fn then(self, continuation: Continuation) -> Self {
        self.policy.continuations.push(continuation);
        self
    }
}
