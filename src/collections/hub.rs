use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cell::TRef;
use crate::collections::{ShutdownError, Strategy};
use crate::ops::atomically_or_err;
use crate::scope::Scope;
use crate::term::{fail, guard, retry, succeed, Stm, TxValue};

/// Shared between all subscriptions of all hubs.
static SUB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One published message: the value, the number of subscribers that have
/// not consumed it yet, and the cell holding the rest of the list. The value
/// is shared-immutable; only the counter changes, and it lives in a cell of
/// its own so every mutation flows through the journal.
#[derive(Clone)]
struct HNode<T> {
    value: T,
    remaining: TRef<usize>,
    next: TRef<HList<T>>,
}

/// A cell of the publisher-node list: empty or a cons of a node.
#[derive(Clone)]
enum HList<T> {
    Nil,
    Cons(HNode<T>),
}

/// A position in the publisher-node list: the cell whose node will be
/// consumed next.
type Cursor<T> = TRef<TRef<HList<T>>>;

/// Transactional multi-producer/multi-subscriber hub.
///
/// Publishers append nodes at `tail`; every subscriber owns a cursor into
/// the list and consumes at its own pace. `head` points at the first node
/// some subscriber still references; a node is reclaimed from the head once
/// every subscriber has moved past it. The hub's size is the distance from
/// the slowest cursor to the tail, so a message is never stored once nobody
/// is left to receive it.
///
/// A subscriber only sees messages published after it subscribed.
pub struct THub<T> {
    head: Cursor<T>,
    tail: Cursor<T>,
    len: TRef<usize>,
    sub_count: TRef<usize>,
    subs: TRef<BTreeMap<u64, Cursor<T>>>,
    down: TRef<bool>,
    capacity: usize,
    strategy: Strategy,
}

impl<T> Clone for THub<T> {
    fn clone(&self) -> Self {
        THub {
            head: self.head.clone(),
            tail: self.tail.clone(),
            len: self.len.clone(),
            sub_count: self.sub_count.clone(),
            subs: self.subs.clone(),
            down: self.down.clone(),
            capacity: self.capacity,
            strategy: self.strategy,
        }
    }
}

/// A live subscriber: a cursor into the hub's publisher-node list.
///
/// Terminated by [Subscription::unsubscribe], after which its operations
/// fail; there is no way back to the live state.
pub struct Subscription<T> {
    id: u64,
    hub: THub<T>,
    cursor: Cursor<T>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Subscription {
            id: self.id,
            hub: self.hub.clone(),
            cursor: self.cursor.clone(),
        }
    }
}

/// Decrement the not-yet-consumed counter of every node from `cell` to the
/// end of the list, on behalf of a departing subscriber.
fn release_from<T: TxValue>(cell: TRef<HList<T>>) -> Stm<(), ShutdownError> {
    cell.get().and_then(move |list| match list {
        HList::Nil => succeed(()),
        HList::Cons(node) => node.remaining.update(|n| n - 1).and_then({
            let next = node.next.clone();
            move |_| release_from(next.clone())
        }),
    })
}

/// Advance the head past every fully consumed node, reclaiming them and
/// shrinking the hub.
fn reclaim<T: TxValue>(hub: THub<T>) -> Stm<(), ShutdownError> {
    let hub2 = hub.clone();
    hub.head.get().and_then(move |cell| {
        let hub = hub2.clone();
        cell.get().and_then(move |list| match list {
            HList::Nil => succeed(()),
            HList::Cons(node) => {
                let hub = hub.clone();
                let next = node.next.clone();
                node.remaining.get().and_then(move |remaining| {
                    if remaining == 0 {
                        let again = hub.clone();
                        hub.head
                            .set(next.clone())
                            .and_then({
                                let len = hub.len.clone();
                                move |_| len.update(|n| n - 1)
                            })
                            .and_then(move |_| reclaim(again.clone()))
                    } else {
                        succeed(())
                    }
                })
            }
        })
    })
}

impl<T: TxValue> THub<T> {
    fn with_strategy(capacity: usize, strategy: Strategy) -> THub<T> {
        let hole: TRef<HList<T>> = TRef::new(HList::Nil);
        THub {
            head: TRef::new(hole.clone()),
            tail: TRef::new(hole),
            len: TRef::new(0),
            sub_count: TRef::new(0),
            subs: TRef::new(BTreeMap::new()),
            down: TRef::new(false),
            capacity,
            strategy,
        }
    }

    /// Bounded hub; a full hub blocks publishers until a slow subscriber
    /// makes room.
    pub fn bounded(capacity: usize) -> THub<T> {
        assert!(capacity > 0, "capacity must be positive");
        Self::with_strategy(capacity, Strategy::Backpressure)
    }

    /// Bounded hub; a full hub rejects new messages.
    pub fn dropping(capacity: usize) -> THub<T> {
        assert!(capacity > 0, "capacity must be positive");
        Self::with_strategy(capacity, Strategy::Dropping)
    }

    /// Bounded hub; a full hub evicts its oldest message.
    pub fn sliding(capacity: usize) -> THub<T> {
        assert!(capacity > 0, "capacity must be positive");
        Self::with_strategy(capacity, Strategy::Sliding)
    }

    /// Hub without a bound.
    pub fn unbounded() -> THub<T> {
        Self::with_strategy(usize::MAX, Strategy::Unbounded)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Append a node for `remaining` subscribers at the tail.
    fn append(&self, value: T, remaining: usize) -> Stm<(), ShutdownError> {
        let tail = self.tail.clone();
        let len = self.len.clone();
        tail.get().and_then(move |hole| {
            let next: TRef<HList<T>> = TRef::new(HList::Nil);
            let node = HNode {
                value: value.clone(),
                remaining: TRef::new(remaining),
                next: next.clone(),
            };
            hole.set(HList::Cons(node))
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

    /// Evict the oldest message, pulling along any cursor that pointed at
    /// it so no subscriber is left behind the head.
    fn slide(&self) -> Stm<(), ShutdownError> {
        let hub = self.clone();
        self.head.get().and_then(move |cell| {
            let hub = hub.clone();
            let evicted = cell.clone();
            cell.get().and_then(move |list| match list {
                HList::Nil => succeed(()),
                HList::Cons(node) => {
                    let hub = hub.clone();
                    let evicted = evicted.clone();
                    let next = node.next.clone();
                    hub.head
                        .set(next.clone())
                        .and_then({
                            let len = hub.len.clone();
                            move |_| len.update(|n| n - 1)
                        })
                        .and_then({
                            let hub = hub.clone();
                            move |_| {
                                let evicted = evicted.clone();
                                let next = next.clone();
                                hub.subs.get().and_then(move |subs| {
                                    let mut chain: Stm<(), ShutdownError> = succeed(());
                                    for cursor in subs.values() {
                                        let cursor = cursor.clone();
                                        let evicted = evicted.clone();
                                        let next = next.clone();
                                        chain = chain.and_then(move |_| {
                                            let set_to = next.clone();
                                            let target = cursor.clone();
                                            let evicted = evicted.clone();
                                            cursor.get().and_then(move |at| {
                                                if at == evicted {
                                                    target.set(set_to.clone())
                                                } else {
                                                    succeed(())
                                                }
                                            })
                                        });
                                    }
                                    chain
                                })
                            }
                        })
                }
            })
        })
    }

    /// Publish a message to every current subscriber.
    ///
    /// With no subscribers the message has nowhere to go and the publish
    /// succeeds by convention. On a full hub the admission strategy decides:
    /// backpressure blocks, dropping returns `false`, sliding evicts the
    /// oldest message and admits.
    pub fn publish(&self, value: T) -> Stm<bool, ShutdownError> {
        let hub = self.clone();
        self.down.get().and_then(move |down| {
            if down {
                return fail(ShutdownError);
            }
            let hub = hub.clone();
            let value = value.clone();
            hub.sub_count.get().and_then(move |subscribers| {
                if subscribers == 0 {
                    return succeed(true);
                }
                let hub = hub.clone();
                let value = value.clone();
                hub.len.get().and_then(move |len| {
                    if len < hub.capacity {
                        return hub.append(value.clone(), subscribers).map(|_| true);
                    }
                    match hub.strategy {
                        Strategy::Backpressure => retry(),
                        Strategy::Dropping => succeed(false),
                        Strategy::Sliding => {
                            let hub2 = hub.clone();
                            let value = value.clone();
                            hub.slide()
                                .and_then(move |_| hub2.append(value.clone(), subscribers))
                                .map(|_| true)
                        }
                        Strategy::Unbounded => hub.append(value.clone(), subscribers).map(|_| true),
                    }
                })
            })
        })
    }

    /// Publish many messages in order, atomically. Returns whether every
    /// message was admitted.
    pub fn publish_all(&self, values: Vec<T>) -> Stm<bool, ShutdownError> {
        fn go<T: TxValue>(
            hub: THub<T>,
            values: Vec<T>,
            index: usize,
            all: bool,
        ) -> Stm<bool, ShutdownError> {
            match values.get(index) {
                None => succeed(all),
                Some(value) => {
                    let hub2 = hub.clone();
                    hub.publish(value.clone()).and_then(move |admitted| {
                        go(hub2.clone(), values.clone(), index + 1, all && admitted)
                    })
                }
            }
        }
        go(self.clone(), values, 0, true)
    }

    /// Register a new subscriber. It will see only messages published after
    /// this transaction commits.
    pub fn subscribe(&self) -> Stm<Subscription<T>, ShutdownError> {
        let hub = self.clone();
        self.down.get().and_then(move |down| {
            if down {
                return fail(ShutdownError);
            }
            let hub = hub.clone();
            hub.tail.get().and_then(move |tail_cell| {
                let id = SUB_COUNTER.fetch_add(1, Ordering::Relaxed);
                let cursor: Cursor<T> = TRef::new(tail_cell);
                let hub2 = hub.clone();
                let cursor2 = cursor.clone();
                hub.subs
                    .update(move |mut subs| {
                        subs.insert(id, cursor2.clone());
                        subs
                    })
                    .and_then({
                        let hub = hub2.clone();
                        move |_| hub.sub_count.update(|n| n + 1)
                    })
                    .map(move |_| Subscription {
                        id,
                        hub: hub2.clone(),
                        cursor: cursor.clone(),
                    })
            })
        })
    }

    /// Number of messages the slowest subscriber has not consumed yet.
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

    pub fn subscriber_count(&self) -> Stm<usize, ShutdownError> {
        self.sub_count.get()
    }

    /// Set the shutdown flag. Blocked publishers and takers wake and
    /// observe the terminal state. Idempotent.
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

    /// Block until the hub has been shut down.
    pub fn await_shutdown(&self) -> Stm<(), ShutdownError> {
        self.down.get().and_then(|down| guard(down))
    }
}

impl<T: TxValue> Subscription<T> {
    /// Fail once this subscription has been terminated.
    fn ensure_live(&self) -> Stm<(), ShutdownError> {
        let id = self.id;
        self.hub.subs.get().and_then(move |subs| {
            if subs.contains_key(&id) {
                succeed(())
            } else {
                fail(ShutdownError)
            }
        })
    }

    /// Whether the subscription is still live.
    pub fn is_live(&self) -> Stm<bool, ShutdownError> {
        let id = self.id;
        self.hub.subs.get().map(move |subs| subs.contains_key(&id))
    }

    /// Consume the message under the cursor if there is one. Advances the
    /// cursor and reclaims the node when this subscriber was the last one
    /// holding the head back.
    fn try_take(&self) -> Stm<Option<T>, ShutdownError> {
        let sub = self.clone();
        self.cursor.get().and_then(move |cell| {
            let sub = sub.clone();
            let consumed = cell.clone();
            cell.get().and_then(move |list| match list {
                HList::Nil => succeed(None),
                HList::Cons(node) => {
                    let sub = sub.clone();
                    let consumed = consumed.clone();
                    let value = node.value.clone();
                    let next = node.next.clone();
                    sub.cursor
                        .set(next.clone())
                        .and_then({
                            let remaining = node.remaining.clone();
                            move |_| remaining.modify(|n| (n - 1, n - 1))
                        })
                        .and_then(move |left| {
                            if left > 0 {
                                return succeed(());
                            }
                            let hub = sub.hub.clone();
                            let consumed = consumed.clone();
                            let next = next.clone();
                            hub.head.get().and_then(move |head_cell| {
                                if head_cell == consumed {
                                    let len = hub.len.clone();
                                    hub.head
                                        .set(next.clone())
                                        .and_then(move |_| len.update(|n| n - 1))
                                } else {
                                    succeed(())
                                }
                            })
                        })
                        .map(move |_| Some(value.clone()))
                }
            })
        })
    }

    /// Consume the next message, blocking while nothing new has been
    /// published. Fails once the subscription is terminated, or once the
    /// hub is shut down and this subscriber has drained its backlog.
    pub fn take(&self) -> Stm<T, ShutdownError> {
        let sub = self.clone();
        self.ensure_live()
            .and_then(move |_| {
                let sub = sub.clone();
                sub.clone().try_take().and_then(move |taken| match taken {
                    Some(value) => succeed(value),
                    None => {
                        let down = sub.hub.down.clone();
                        down.get()
                            .and_then(|down| if down { fail(ShutdownError) } else { retry() })
                    }
                })
            })
    }

    /// Consume up to `n` pending messages, in publish order. Never blocks.
    pub fn take_upto(&self, n: usize) -> Stm<Vec<T>, ShutdownError> {
        fn go<T: TxValue>(
            sub: Subscription<T>,
            left: usize,
            acc: Vec<T>,
        ) -> Stm<Vec<T>, ShutdownError> {
            if left == 0 {
                return succeed(acc);
            }
            let sub2 = sub.clone();
            sub.try_take().and_then(move |taken| match taken {
                Some(value) => {
                    let mut acc = acc.clone();
                    acc.push(value);
                    go(sub2.clone(), left - 1, acc)
                }
                None if acc.is_empty() => {
                    let down = sub2.hub.down.clone();
                    down.get().and_then(|down| {
                        if down {
                            fail(ShutdownError)
                        } else {
                            succeed(Vec::new())
                        }
                    })
                }
                None => succeed(acc.clone()),
            })
        }
        let sub = self.clone();
        self.ensure_live().and_then(move |_| go(sub.clone(), n, Vec::new()))
    }

    /// Consume every pending message. Never blocks.
    pub fn take_all(&self) -> Stm<Vec<T>, ShutdownError> {
        self.take_upto(usize::MAX)
    }

    /// Terminate the subscription: leave the subscriber set, release every
    /// unconsumed node and reclaim the ones nobody else references.
    /// Idempotent, so a scope can release it again after a cancelled fiber
    /// already did.
    pub fn unsubscribe(&self) -> Stm<(), ShutdownError> {
        let sub = self.clone();
        self.hub.subs.get().and_then(move |subs| {
            if !subs.contains_key(&sub.id) {
                return succeed(());
            }
            let sub = sub.clone();
            let id = sub.id;
            sub.hub
                .subs
                .update(move |mut m| {
                    m.remove(&id);
                    m
                })
                .and_then({
                    let hub = sub.hub.clone();
                    move |_| hub.sub_count.update(|n| n - 1)
                })
                .and_then({
                    let cursor = sub.cursor.clone();
                    move |_| {
                        let cursor = cursor.clone();
                        cursor.get().and_then(|cell| release_from(cell))
                    }
                })
                .and_then({
                    let hub = sub.hub.clone();
                    move |_| reclaim(hub.clone())
                })
        })
    }
}

/// Subscribe for the lifetime of a scope: the subscription is terminated in
/// a fresh transaction when the scope exits.
pub async fn subscribe_scoped<T: TxValue>(
    hub: &THub<T>,
    scope: &Scope,
) -> Result<Subscription<T>, ShutdownError> {
    let sub = atomically_or_err(hub.subscribe()).await?;
    let cleanup = sub.clone();
    scope.add_finalizer(move || async move {
        let _ = atomically_or_err(cleanup.unsubscribe()).await;
    });
    Ok(sub)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::atomically_or_err;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn ok<V: TxValue>(stm: Stm<V, ShutdownError>) -> V {
        atomically_or_err(stm).await.unwrap()
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let hub = THub::<i32>::bounded(4);
        assert!(ok(hub.publish(1)).await);
        assert_eq!(ok(hub.size()).await, 0);
    }

    #[tokio::test]
    async fn single_subscriber_receives_in_order() {
        let hub = THub::<i32>::bounded(4);
        let sub = ok(hub.subscribe()).await;

        assert!(ok(hub.publish_all(vec![7, 1, 4, 2])).await);

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(ok(sub.take()).await);
        }
        assert_eq!(received, vec![7, 1, 4, 2]);
        assert_eq!(ok(hub.size()).await, 0);
    }

    #[tokio::test]
    async fn subscriber_sees_only_later_messages() {
        let hub = THub::<i32>::unbounded();
        ok(hub.publish(1)).await;

        let sub = ok(hub.subscribe()).await;
        ok(hub.publish(2)).await;

        assert_eq!(ok(sub.take_all()).await, vec![2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backpressure_bounds_size_and_delivers_all() {
        let hub = THub::<i32>::bounded(2);
        let sub = ok(hub.subscribe()).await;
        let publisher = hub.clone();

        tokio::spawn(async move {
            for i in 1..=5 {
                ok(publisher.publish(i)).await;
            }
        });

        let mut received = Vec::new();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let hub2 = hub.clone();
            let (value, size) = ok(sub
                .take()
                .and_then(move |v| hub2.size().map(move |s| (v, s))))
            .await;
            assert!(size <= 2, "hub size {} exceeded capacity", size);
            received.push(value);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn dropping_keeps_oldest() {
        let hub = THub::<i32>::dropping(2);
        let sub = ok(hub.subscribe()).await;

        assert!(ok(hub.publish(1)).await);
        assert!(ok(hub.publish(2)).await);
        assert!(!ok(hub.publish(3)).await);

        assert_eq!(ok(sub.take_all()).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn sliding_keeps_latest_for_every_subscriber() {
        let hub = THub::<i32>::sliding(2);
        let sub1 = ok(hub.subscribe()).await;
        let sub2 = ok(hub.subscribe()).await;

        assert!(ok(hub.publish_all(vec![1, 2, 3, 4])).await);
        assert_eq!(ok(hub.size()).await, 2);

        let got1 = ok(sub1.take_all()).await;
        let got2 = ok(sub2.take_all()).await;
        assert_eq!(got1, vec![3, 4]);
        assert_eq!(got2, vec![3, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_publishers_preserve_per_publisher_order() {
        let hub = THub::<i32>::unbounded();
        let sub1 = ok(hub.subscribe()).await;
        let sub2 = ok(hub.subscribe()).await;

        let p1 = hub.clone();
        let p2 = hub.clone();
        let pub1 = tokio::spawn(async move {
            for i in 1..=10 {
                ok(p1.publish(i)).await;
            }
        });
        let pub2 = tokio::spawn(async move {
            for i in 1..=10 {
                ok(p2.publish(-i)).await;
            }
        });

        let mut consumers = Vec::new();
        for sub in [sub1, sub2] {
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..20 {
                    got.push(ok(sub.take()).await);
                }
                got
            }));
        }

        pub1.await.unwrap();
        pub2.await.unwrap();

        for consumer in consumers {
            let got = consumer.await.unwrap();
            let positives: Vec<i32> = got.iter().copied().filter(|v| *v > 0).collect();
            let negatives: Vec<i32> = got.iter().copied().filter(|v| *v < 0).collect();
            assert_eq!(positives, (1..=10).collect::<Vec<_>>());
            assert_eq!(negatives, (1..=10).map(|i| -i).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn unsubscribe_reclaims_unconsumed_nodes() {
        let hub = THub::<i32>::unbounded();
        let sub1 = ok(hub.subscribe()).await;
        let sub2 = ok(hub.subscribe()).await;

        ok(hub.publish_all(vec![10, 20])).await;
        assert_eq!(ok(sub1.take()).await, 10);
        assert_eq!(ok(hub.size()).await, 2);

        ok(sub2.unsubscribe()).await;
        assert_eq!(ok(hub.size()).await, 1);
        assert_eq!(ok(hub.subscriber_count()).await, 1);

        // Unsubscribe is idempotent.
        ok(sub2.unsubscribe()).await;
        assert_eq!(ok(hub.subscriber_count()).await, 1);

        assert_eq!(ok(sub1.take()).await, 20);
        assert_eq!(ok(hub.size()).await, 0);
    }

    #[tokio::test]
    async fn terminated_subscription_fails() {
        let hub = THub::<i32>::unbounded();
        let sub = ok(hub.subscribe()).await;
        ok(sub.unsubscribe()).await;

        assert_eq!(atomically_or_err(sub.take()).await, Err(ShutdownError));
        assert!(!ok(sub.is_live()).await);
    }

    #[tokio::test]
    async fn shutdown_drains_then_fails() {
        let hub = THub::<i32>::unbounded();
        let sub = ok(hub.subscribe()).await;
        ok(hub.publish(1)).await;
        ok(hub.shutdown()).await;

        assert_eq!(
            atomically_or_err(hub.publish(2)).await,
            Err(ShutdownError)
        );
        assert_eq!(ok(sub.take()).await, 1);
        assert_eq!(atomically_or_err(sub.take()).await, Err(ShutdownError));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_subscriber_wakes_on_publish() {
        let hub = THub::<i32>::unbounded();
        let sub = ok(hub.subscribe()).await;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let v = ok(sub.take()).await;
            sender.send(v).unwrap();
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        ok(hub.publish(9)).await;

        let v = tokio::time::timeout(Duration::from_millis(500), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v, 9);
    }

    #[tokio::test]
    async fn scoped_subscription_released_on_scope_exit() {
        let hub = THub::<i32>::unbounded();
        let scope = Scope::new();

        let sub = subscribe_scoped(&hub, &scope).await.unwrap();
        ok(hub.publish(5)).await;
        assert_eq!(ok(sub.take()).await, 5);
        assert_eq!(ok(hub.subscriber_count()).await, 1);

        scope.close().await;
        assert_eq!(ok(hub.subscriber_count()).await, 0);
        assert!(!ok(sub.is_live()).await);
        // With the subscriber gone, publishes succeed by convention.
        assert!(ok(hub.publish(6)).await);
        assert_eq!(ok(hub.size()).await, 0);
    }
}
