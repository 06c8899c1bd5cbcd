use crate::cell::TRef;
use crate::collections::{ShutdownError, Strategy};
use crate::term::{fail, guard, retry, succeed, Stm, TxValue};

/// A cell that is either empty or a cons of an element and the rest of the
/// list, which is itself a cell.
#[derive(Clone)]
enum TList<T> {
    Nil,
    Cons(T, TRef<TList<T>>),
}

/// Transactional FIFO queue over a linked list of cells.
///
/// `head` points at the cell holding the oldest element, `tail` at the empty
/// cell the next element will land in. Granular cells mean a reader and a
/// writer touch disjoint state on a non-empty queue, so they don't invalidate
/// each other.
///
/// What happens on a full queue is decided by the admission [Strategy] fixed
/// at construction time.
pub struct TQueue<T> {
    head: TRef<TRef<TList<T>>>,
    tail: TRef<TRef<TList<T>>>,
    len: TRef<usize>,
    down: TRef<bool>,
    capacity: usize,
    strategy: Strategy,
}

impl<T> Clone for TQueue<T> {
    fn clone(&self) -> Self {
        TQueue {
            head: self.head.clone(),
            tail: self.tail.clone(),
            len: self.len.clone(),
            down: self.down.clone(),
            capacity: self.capacity,
            strategy: self.strategy,
        }
    }
}

impl<T: TxValue> TQueue<T> {
    fn with_strategy(capacity: usize, strategy: Strategy) -> TQueue<T> {
        let hole: TRef<TList<T>> = TRef::new(TList::Nil);
        TQueue {
            head: TRef::new(hole.clone()),
            tail: TRef::new(hole),
            len: TRef::new(0),
            down: TRef::new(false),
            capacity,
            strategy,
        }
    }

    /// Bounded queue; a full queue blocks offers until room is made.
    pub fn bounded(capacity: usize) -> TQueue<T> {
        assert!(capacity > 0, "capacity must be positive");
        Self::with_strategy(capacity, Strategy::Backpressure)
    }

    /// Bounded queue; a full queue rejects new elements.
    pub fn dropping(capacity: usize) -> TQueue<T> {
        assert!(capacity > 0, "capacity must be positive");
        Self::with_strategy(capacity, Strategy::Dropping)
    }

    /// Bounded queue; a full queue evicts its oldest element.
    pub fn sliding(capacity: usize) -> TQueue<T> {
        assert!(capacity > 0, "capacity must be positive");
        Self::with_strategy(capacity, Strategy::Sliding)
    }

    /// Queue without a bound.
    pub fn unbounded() -> TQueue<T> {
        Self::with_strategy(usize::MAX, Strategy::Unbounded)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Append to the end of the queue: fill the tail hole with a cons and
    /// point the tail at a fresh hole.
    fn push_back(&self, value: T) -> Stm<(), ShutdownError> {
        let tail = self.tail.clone();
        let len = self.len.clone();
        tail.get().and_then(move |hole| {
            let next: TRef<TList<T>> = TRef::new(TList::Nil);
            hole.set(TList::Cons(value.clone(), next.clone()))
                .and_then({
                    let tail = tail.clone();
                    move |_| tail.set(next.clone())
                })
                .and_then({
                    let len = len.clone();
                    move |_| len.update(|n| n + 1)
                })
        })
    }

    /// Remove the oldest element if there is one. Never blocks.
    fn pop_front(&self) -> Stm<Option<T>, ShutdownError> {
        let head = self.head.clone();
        let len = self.len.clone();
        head.get().and_then(move |cell| {
            let head = head.clone();
            let len = len.clone();
            cell.get().and_then(move |list| match list {
                TList::Nil => succeed(None),
                TList::Cons(value, rest) => head
                    .set(rest)
                    .and_then({
                        let len = len.clone();
                        move |_| len.update(|n| n - 1)
                    })
                    .map(move |_| Some(value.clone())),
            })
        })
    }

    /// The oldest element without removing it.
    fn first(&self) -> Stm<Option<T>, ShutdownError> {
        self.head.get().and_then(|cell| {
            cell.get().map(|list| match list {
                TList::Nil => None,
                TList::Cons(value, _) => Some(value),
            })
        })
    }

    /// Add an element. Returns whether it was admitted: `false` only for a
    /// full dropping queue. A full backpressure queue blocks instead; a full
    /// sliding queue evicts its head and admits.
    pub fn offer(&self, value: T) -> Stm<bool, ShutdownError> {
        let q = self.clone();
        self.down.get().and_then(move |down| {
            if down {
                return fail(ShutdownError);
            }
            let q = q.clone();
            let value = value.clone();
            q.len.get().and_then(move |len| {
                if len < q.capacity {
                    return q.push_back(value.clone()).map(|_| true);
                }
                match q.strategy {
                    Strategy::Backpressure => retry(),
                    Strategy::Dropping => succeed(false),
                    Strategy::Sliding => {
                        let q2 = q.clone();
                        let value = value.clone();
                        q.pop_front()
                            .and_then(move |_| q2.push_back(value.clone()))
                            .map(|_| true)
                    }
                    Strategy::Unbounded => q.push_back(value.clone()).map(|_| true),
                }
            })
        })
    }

    /// Add many elements in order, atomically. Returns whether every element
    /// was admitted.
    pub fn offer_all(&self, values: Vec<T>) -> Stm<bool, ShutdownError> {
        fn go<T: TxValue>(
            q: TQueue<T>,
            values: Vec<T>,
            index: usize,
            all: bool,
        ) -> Stm<bool, ShutdownError> {
            match values.get(index) {
                None => succeed(all),
                Some(value) => {
                    let q2 = q.clone();
                    q.offer(value.clone()).and_then(move |admitted| {
                        go(q2.clone(), values.clone(), index + 1, all && admitted)
                    })
                }
            }
        }
        go(self.clone(), values, 0, true)
    }

    /// Remove and return the oldest element, blocking while the queue is
    /// empty. Fails once the queue is shut down and drained.
    pub fn take(&self) -> Stm<T, ShutdownError> {
        let q = self.clone();
        self.pop_front().and_then(move |popped| match popped {
            Some(value) => succeed(value),
            None => q.terminal_or(retry()),
        })
    }

    /// Remove and return the oldest element if there is one. Never blocks;
    /// fails once the queue is shut down and drained.
    pub fn poll(&self) -> Stm<Option<T>, ShutdownError> {
        let q = self.clone();
        self.pop_front().and_then(move |popped| match popped {
            Some(value) => succeed(Some(value)),
            None => q.terminal_or(succeed(None)),
        })
    }

    /// The oldest element without removing it, blocking while the queue is
    /// empty. Fails once the queue is shut down and drained.
    pub fn peek(&self) -> Stm<T, ShutdownError> {
        let q = self.clone();
        self.first().and_then(move |first| match first {
            Some(value) => succeed(value),
            None => q.terminal_or(retry()),
        })
    }

    /// Remove and return every element. Never blocks; an empty live queue
    /// yields an empty vector. Fails once the queue is shut down and drained.
    pub fn take_all(&self) -> Stm<Vec<T>, ShutdownError> {
        self.take_upto(usize::MAX)
    }

    /// Remove and return up to `n` oldest elements, in order. Never blocks.
    pub fn take_upto(&self, n: usize) -> Stm<Vec<T>, ShutdownError> {
        fn go<T: TxValue>(q: TQueue<T>, left: usize, acc: Vec<T>) -> Stm<Vec<T>, ShutdownError> {
            if left == 0 {
                return succeed(acc);
            }
            let q2 = q.clone();
            q.pop_front().and_then(move |popped| match popped {
                Some(value) => {
                    let mut acc = acc.clone();
                    acc.push(value);
                    go(q2.clone(), left - 1, acc)
                }
                None if acc.is_empty() => q2.terminal_or(succeed(Vec::new())),
                None => succeed(acc.clone()),
            })
        }
        go(self.clone(), n, Vec::new())
    }

    /// On an empty queue: the given continuation while live, the shutdown
    /// failure once the flag is set.
    fn terminal_or<R: TxValue>(&self, live: Stm<R, ShutdownError>) -> Stm<R, ShutdownError> {
        self.down
            .get()
            .and_then(move |down| if down { fail(ShutdownError) } else { live.clone() })
    }

    pub fn size(&self) -> Stm<usize, ShutdownError> {
        self.len.get()
    }

    pub fn is_empty(&self) -> Stm<bool, ShutdownError> {
        self.len.get().map(|n| n == 0)
    }

    pub fn is_full(&self) -> Stm<bool, ShutdownError> {
        let capacity = self.capacity;
        self.len.get().map(move |n| n >= capacity)
    }

    /// Set the shutdown flag. Waiting takers and offerers wake and observe
    /// the terminal state. Idempotent.
    pub fn shutdown(&self) -> Stm<(), ShutdownError> {
        let down = self.down.clone();
        self.down.get().and_then(move |flag| {
            if flag {
                succeed(())
            } else {
                down.set(true)
            }
        })
    }

    /// Block until the queue has been shut down.
    pub fn await_shutdown(&self) -> Stm<(), ShutdownError> {
        self.down.get().and_then(|down| guard(down))
    }
}
