use std::{any::Any, convert::Infallible, marker::PhantomData, sync::Arc};

use crate::cell::{downcast_owned, CellRef, DynValue};

/// Values and errors that can flow through a transaction.
///
/// Terms are re-executed on conflict, so everything they carry must be
/// cheaply duplicable and sharable between the fibers that race on commit.
pub trait TxValue: Any + Send + Sync + Clone + 'static {}

impl<T: Any + Send + Sync + Clone + 'static> TxValue for T {}

/// A defect: an unrecoverable breach raised by `die` or by the `interrupt`
/// primitive. Not part of the error channel; it tears the transaction down
/// and reaches the fiber as a panic unless the caller inspects the
/// [crate::TxStatus] directly.
#[derive(Clone, Debug, thiserror::Error)]
#[error("transaction defect: {message}")]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    pub fn new(message: impl Into<String>) -> Defect {
        Defect {
            message: message.into().into(),
        }
    }

    pub(crate) fn interrupted() -> Defect {
        Defect::new("interrupted")
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Environment threaded through a transaction by `provide_env` / `with_env`.
pub type TxEnv = Arc<dyn Any + Send + Sync>;

pub(crate) type ContFn = Arc<dyn Fn(DynValue) -> Term + Send + Sync>;
pub(crate) type SyncFn = Arc<dyn Fn() -> DynValue + Send + Sync>;
pub(crate) type EnvFn = Arc<dyn Fn(&TxEnv) -> Term + Send + Sync>;

/// Suspended description of a transaction.
///
/// A tagged tree over the journal primitives; every combinator the crate
/// exposes desugars to these variants. Terms are immutable, share structure
/// through `Arc`, and may be interpreted any number of times, so the stored
/// closures must be referentially transparent outside the journal.
#[derive(Clone)]
pub(crate) enum Term {
    Succeed(DynValue),
    Sync(SyncFn),
    Fail(DynValue),
    Retry,
    Die(Defect),
    Interrupt,
    Read(CellRef),
    Write(CellRef, DynValue),
    FlatMap(Arc<Term>, ContFn),
    Fold(Arc<Term>, ContFn, ContFn),
    OrTry(Arc<Term>, Arc<Term>),
    ProvideEnv(TxEnv, Arc<Term>),
    WithEnv(EnvFn),
}

/// A transaction producing `T` or aborting with `E`.
///
/// Infallible by default; methods that can abort carry their error type and
/// must be run with [crate::atomically_or_err].
pub struct Stm<T, E = Infallible> {
    pub(crate) term: Term,
    marker: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Clone for Stm<T, E> {
    fn clone(&self) -> Self {
        Stm {
            term: self.term.clone(),
            marker: PhantomData,
        }
    }
}

/// Succeed with a value.
pub fn succeed<T: TxValue, E>(value: T) -> Stm<T, E> {
    Stm::from_term(Term::Succeed(Arc::new(value)))
}

/// Succeed with the result of a deferred pure computation, evaluated once
/// per attempt.
pub fn sync<T, E, F>(f: F) -> Stm<T, E>
where
    T: TxValue,
    F: Fn() -> T + Send + Sync + 'static,
{
    Stm::from_term(Term::Sync(Arc::new(move || Arc::new(f()) as DynValue)))
}

/// Abort the transaction with an error. Recoverable with [Stm::fold] or
/// [Stm::catch]; otherwise surfaces from [crate::atomically_or_err].
pub fn fail<T, E: TxValue>(error: E) -> Stm<T, E> {
    Stm::from_term(Term::Fail(Arc::new(error)))
}

/// Abandon the attempt and park until one of the cells read so far changes.
pub fn retry<T, E>() -> Stm<T, E> {
    Stm::from_term(Term::Retry)
}

/// Retry unless a given condition has been met.
pub fn guard<E>(cond: bool) -> Stm<(), E> {
    if cond {
        Stm::from_term(Term::Succeed(unit()))
    } else {
        retry()
    }
}

/// Alias of [guard]: block the transaction until the condition holds.
pub fn check<E>(cond: bool) -> Stm<(), E> {
    guard(cond)
}

/// Tear the transaction down with a defect. Not catchable in transaction
/// code; the writes are discarded and the defect reaches the fiber.
pub fn die<T, E>(defect: Defect) -> Stm<T, E> {
    Stm::from_term(Term::Die(defect))
}

/// Tear the transaction down as interrupted.
pub fn interrupt<T, E>() -> Stm<T, E> {
    Stm::from_term(Term::Interrupt)
}

/// Build a transaction from the environment provided by an enclosing
/// [Stm::provide_env].
pub fn with_env<T, E, F>(f: F) -> Stm<T, E>
where
    F: Fn(&TxEnv) -> Stm<T, E> + Send + Sync + 'static,
{
    Stm::from_term(Term::WithEnv(Arc::new(move |env| f(env).term)))
}

pub(crate) fn unit() -> DynValue {
    Arc::new(())
}

impl<T, E> Stm<T, E> {
    pub(crate) fn from_term(term: Term) -> Stm<T, E> {
        Stm {
            term,
            marker: PhantomData,
        }
    }

    /// Run this transaction against the given environment.
    pub fn provide_env(self, env: TxEnv) -> Stm<T, E> {
        Stm::from_term(Term::ProvideEnv(env, Arc::new(self.term)))
    }
}

impl<T: TxValue, E: TxValue> Stm<T, E> {
    /// Sequence a dependent transaction after this one.
    pub fn and_then<U, K>(self, k: K) -> Stm<U, E>
    where
        U: TxValue,
        K: Fn(T) -> Stm<U, E> + Send + Sync + 'static,
    {
        Stm::from_term(Term::FlatMap(
            Arc::new(self.term),
            Arc::new(move |value| k(downcast_owned::<T>(value)).term),
        ))
    }

    /// Transform the result.
    pub fn map<U, F>(self, f: F) -> Stm<U, E>
    where
        U: TxValue,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Stm::from_term(Term::FlatMap(
            Arc::new(self.term),
            Arc::new(move |value| Term::Succeed(Arc::new(f(downcast_owned::<T>(value))))),
        ))
    }

    /// Handle both channels, trapping Failure but never Retry or a defect.
    pub fn fold<U, E2, Ff, Fs>(self, on_fail: Ff, on_succeed: Fs) -> Stm<U, E2>
    where
        U: TxValue,
        E2: TxValue,
        Ff: Fn(E) -> Stm<U, E2> + Send + Sync + 'static,
        Fs: Fn(T) -> Stm<U, E2> + Send + Sync + 'static,
    {
        Stm::from_term(Term::Fold(
            Arc::new(self.term),
            Arc::new(move |error| on_fail(downcast_owned::<E>(error)).term),
            Arc::new(move |value| on_succeed(downcast_owned::<T>(value)).term),
        ))
    }

    /// Recover from a Failure.
    pub fn catch<E2, H>(self, handler: H) -> Stm<T, E2>
    where
        E2: TxValue,
        H: Fn(E) -> Stm<T, E2> + Send + Sync + 'static,
    {
        self.fold(handler, succeed)
    }

    /// Transform the error channel.
    pub fn map_err<E2, F>(self, f: F) -> Stm<T, E2>
    where
        E2: TxValue,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        self.fold(move |e| fail(f(e)), succeed)
    }

    /// Run this transaction; if it retries, run `other` instead. The cells
    /// read by the abandoned attempt stay observed, so the overall retry
    /// reacts to any of them changing.
    pub fn or_else(self, other: Stm<T, E>) -> Stm<T, E> {
        Stm::from_term(Term::OrTry(Arc::new(self.term), Arc::new(other.term)))
    }

    /// Pair the results of two transactions.
    pub fn zip<U: TxValue>(self, other: Stm<U, E>) -> Stm<(T, U), E> {
        self.zip_with(other, |t, u| (t, u))
    }

    /// Combine the results of two transactions.
    pub fn zip_with<U, R, F>(self, other: Stm<U, E>, f: F) -> Stm<R, E>
    where
        U: TxValue,
        R: TxValue,
        F: Fn(T, U) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.and_then(move |t| {
            let f = f.clone();
            other.clone().map(move |u| f(t.clone(), u))
        })
    }

    /// Run an inspection transaction on the result, passing it through.
    pub fn tap<F>(self, f: F) -> Stm<T, E>
    where
        F: Fn(T) -> Stm<(), E> + Send + Sync + 'static,
    {
        self.and_then(move |t| f(t.clone()).map(move |_| t.clone()))
    }

    /// Discard the result.
    pub fn unit(self) -> Stm<(), E> {
        self.map(|_| ())
    }

    /// Run this transaction only when the condition holds, yielding `None`
    /// otherwise.
    pub fn when(self, cond: bool) -> Stm<Option<T>, E> {
        if cond {
            self.map(Some)
        } else {
            succeed(None)
        }
    }
}
