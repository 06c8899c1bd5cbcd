use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;

use crate::*;

async fn recv_timeout<T>(mut rx: Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "test error instance")
    }
}

impl std::error::Error for TestError {}

#[test]
fn cell_ids_increment() {
    let a = TRef::new(42);
    let b = TRef::new(42);
    assert!(b.id() > a.id());
}

#[tokio::test]
async fn basics() {
    let ta = TRef::new(1);
    let tb = TRef::new(vec![1, 2, 3]);

    let tb2 = tb.clone();
    let stm = ta.get().and_then(move |a| {
        let tb = tb2.clone();
        tb.get().and_then(move |b| {
            let mut grown = b.clone();
            grown.push(4);
            tb.set(grown).map(move |_| (a, b.clone()))
        })
    });

    let (a0, b0) = atomically(stm).await;
    assert_eq!(a0, 1);
    assert_eq!(b0, vec![1, 2, 3]);

    let b1 = atomically(tb.get()).await;
    assert_eq!(b1, vec![1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_if_written_after_read() {
    let ta = TRef::new(1);
    let tac = ta.clone();

    let t = tokio::spawn(async move {
        let slow = tac.get().and_then({
            let tac = tac.clone();
            move |_| {
                let tac = tac.clone();
                sync(|| std::thread::sleep(Duration::from_millis(100)))
                    .and_then(move |_| tac.get())
            }
        });
        atomically(slow).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    atomically(ta.update(|x| x + 1)).await;

    // The write landed between the first read and the end of the attempt,
    // so the attempt was invalidated and re-run against the new value.
    assert_eq!(t.await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_revalidates_at_commit() {
    let ta = TRef::new(1);
    let tac = ta.clone();

    let t = tokio::spawn(async move {
        let slow = tac
            .get()
            .and_then(move |a| sync(move || std::thread::sleep(Duration::from_millis(100))).map(move |_| a));
        atomically(slow).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    atomically(ta.update(|x| x + 1)).await;

    // Even a read-only journal is validated under the commit lock, so the
    // stale observation restarts instead of being surfaced.
    assert_eq!(t.await.unwrap(), 2);
}

#[tokio::test]
async fn or_else_discards_writes_of_retrying_branch() {
    let ta = TRef::new(1);
    let tb = TRef::new("Hello");

    let ta2 = ta.clone();
    let tb2 = tb.clone();
    let stm = tb.set("World").and_then(move |_| {
        let left = ta2.set(2).and_then(|_| retry());
        let right = ta2.get().zip(tb2.get());
        left.or_else(right)
    });

    let (a, b) = atomically(stm).await;
    assert_eq!(a, 1);
    assert_eq!(b, "World");
}

#[tokio::test]
async fn or_else_of_retry_is_second() {
    let v = atomically(retry::<i32, Infallible>().or_else(succeed(5))).await;
    assert_eq!(v, 5);
}

#[tokio::test]
async fn or_else_of_succeed_is_first() {
    let v = atomically(succeed::<i32, Infallible>(1).or_else(succeed(2))).await;
    assert_eq!(v, 1);
}

#[tokio::test]
async fn flat_map_of_succeed_is_continuation() {
    let v = atomically(succeed::<i32, Infallible>(21).and_then(|x| succeed(x * 2))).await;
    assert_eq!(v, 42);
}

#[tokio::test]
async fn fold_of_fail_is_error_branch() {
    let v = atomically(
        fail::<i32, TestError>(TestError).fold(|_| succeed(1), |_| succeed(2)),
    )
    .await;
    assert_eq!(v, 1);
}

#[tokio::test]
async fn fold_of_succeed_is_value_branch() {
    let v = atomically(succeed::<i32, TestError>(7).fold(|_| succeed(0), |x| succeed(x + 1))).await;
    assert_eq!(v, 8);
}

#[tokio::test]
async fn fold_does_not_trap_retry() {
    // The retrying branch reaches the or_else alternative untouched by the
    // fold in between.
    let folded: Stm<i32, TestError> = retry::<i32, TestError>().fold(|_| succeed(-1), succeed);
    let stm = folded.catch(|_| succeed(-2)).or_else(succeed(9));
    let v = atomically(stm).await;
    assert_eq!(v, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_wait_notify() {
    let ta = TRef::new(1);
    let tac = ta.clone();

    let (sender, receiver) = tokio::sync::mpsc::channel(1);

    tokio::spawn(async move {
        let a = atomically(tac.get().and_then(|a| guard(a > 1).map(move |_| a))).await;
        sender.send(a).await.unwrap()
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    atomically(ta.set(2)).await;

    let a = recv_timeout(receiver).await;
    assert_eq!(a, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn check_blocks_until_condition_holds() {
    let ta = TRef::new(0);
    let tac = ta.clone();

    let (sender, receiver) = tokio::sync::mpsc::channel(1);

    tokio::spawn(async move {
        let a = atomically(tac.get().and_then(|a| check(a % 2 == 1).map(move |_| a))).await;
        sender.send(a).await.unwrap()
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    atomically(ta.set(3)).await;

    let a = recv_timeout(receiver).await;
    assert_eq!(a, 3);
}

#[tokio::test]
async fn when_skips_or_runs() {
    let a = TRef::new(0);

    let skipped = atomically(a.replace(1).when(false)).await;
    assert_eq!(skipped, None);
    assert_eq!(atomically(a.get()).await, 0);

    let ran = atomically(a.replace(1).when(true)).await;
    assert_eq!(ran, Some(0));
    assert_eq!(atomically(a.get()).await, 1);
}

#[tokio::test]
async fn new_ref_in_transaction() {
    let v = atomically(sync(|| TRef::new(1)).and_then(|t| {
        let t2 = t.clone();
        t.set(2).and_then(move |_| t2.get())
    }))
    .await;
    assert_eq!(v, 2);
}

#[tokio::test]
async fn abort_with_error_discards_writes() {
    let a = TRef::new(0);

    let a2 = a.clone();
    let r = atomically_or_err(a.set(1).and_then(move |_| fail::<(), TestError>(TestError)))
        .await;
    assert_eq!(r, Err(TestError));

    // Nothing was published.
    assert_eq!(atomically(a2.get()).await, 0);
}

#[tokio::test]
async fn catch_recovers_and_commits() {
    let a = TRef::new(0);

    let a2 = a.clone();
    let recovered = a
        .set(1)
        .and_then(move |_| fail::<i32, TestError>(TestError))
        .catch({
            let a = a.clone();
            move |_| a.get()
        });
    let v = atomically_or_err::<i32, TestError>(recovered.map_err(|e| e)).await;

    // The handler re-ran inside the same transaction, so it sees the write
    // that the failure would otherwise have discarded.
    assert_eq!(v, Ok(1));
    assert_eq!(atomically(a2.get()).await, 1);
}

#[tokio::test]
#[should_panic]
async fn die_panics_the_fiber() {
    atomically(die::<(), Infallible>(Defect::new("boom"))).await;
}

#[tokio::test]
async fn die_is_visible_as_status() {
    let status = atomically_with(&NoopScheduler, die::<(), Infallible>(Defect::new("boom"))).await;
    match status {
        TxStatus::Died(defect) => assert_eq!(defect.message(), "boom"),
        _ => panic!("expected a defect"),
    }
}

#[tokio::test]
async fn interrupt_is_a_defect() {
    let status = atomically_with(&NoopScheduler, interrupt::<(), Infallible>()).await;
    match status {
        TxStatus::Died(defect) => assert_eq!(defect.message(), "interrupted"),
        _ => panic!("expected a defect"),
    }
}

#[tokio::test]
async fn cancelled_fiber_is_interrupted() {
    let sched = FlagScheduler::new(7);
    sched.cancel();

    let status = atomically_with(&sched, succeed::<i32, Infallible>(1)).await;
    assert!(matches!(status, TxStatus::Interrupted));
}

#[tokio::test]
async fn environment_is_scoped() {
    let read_env = || {
        with_env(|env: &TxEnv| {
            let n = env.downcast_ref::<i32>().copied().unwrap_or(0);
            succeed::<i32, Infallible>(n)
        })
    };

    let inner = read_env().provide_env(Arc::new(1i32));
    let stm = inner
        .and_then(move |a| read_env().map(move |b| (a, b)))
        .provide_env(Arc::new(2i32));

    let (a, b) = atomically(stm).await;
    assert_eq!(a, 1);
    assert_eq!(b, 2);
}

#[tokio::test]
async fn deeply_nested_terms_do_not_recurse() {
    let mut stm = succeed::<i64, Infallible>(0);
    for _ in 0..5_000 {
        stm = stm.and_then(|n| succeed(n + 1));
    }
    assert_eq!(atomically(stm).await, 5_000);
}

#[tokio::test]
async fn version_counts_commits() {
    let a = TRef::new(0);
    for i in 1..=5 {
        atomically(a.set(i)).await;
    }
    assert_eq!(a.raw.live_version(), 5);

    atomically(a.get()).await;
    assert_eq!(a.raw.live_version(), 5);
}

#[tokio::test]
async fn stale_journal_is_rejected_at_commit() {
    use crate::commit;
    use crate::exec::{Interp, Outcome};

    let a = TRef::new(1);
    let b = TRef::new(0);

    // Run "read A, write B" to completion but hold the commit back.
    let b2 = b.clone();
    let t1 = a.get().and_then(move |v| b2.set(v + 10));
    let mut interp = Interp::new(&NoopScheduler);
    let outcome = interp.run(t1.term.clone());
    assert!(matches!(outcome, Outcome::Success(_)));

    // A concurrent transaction writes A first.
    atomically(a.update(|x| x + 1)).await;

    // The held-back commit must now be rejected...
    assert!(commit::commit(&interp.journal).is_err());
    assert_eq!(atomically(b.get()).await, 0);

    // ...and the re-run observes the new value of A.
    assert_eq!(atomically(t1.and_then(move |_| b.get())).await, 12);
}

#[tokio::test]
async fn park_registers_in_observed_cells_and_commit_fires() {
    use crate::commit;
    use crate::exec::{Interp, Outcome};

    let a = TRef::new(0);

    let t: Stm<i32, Infallible> = a.get().and_then(|v| guard(v > 0).map(move |_| v));
    let mut interp = Interp::new(&NoopScheduler);
    let outcome = interp.run(t.term.clone());
    assert!(matches!(outcome, Outcome::Retry));

    let (handle, _receiver) = WakeHandle::pair(0);
    assert!(commit::park_candidate(&interp.journal, &handle).is_ok());
    assert_eq!(a.raw.pending_todos(), 1);

    atomically(a.set(1)).await;
    assert!(handle.is_fired());
    assert_eq!(a.raw.pending_todos(), 0);
}

#[tokio::test]
async fn park_is_refused_after_conflicting_write() {
    use crate::commit;
    use crate::exec::{Interp, Outcome};

    let a = TRef::new(0);

    let t: Stm<i32, Infallible> = a.get().and_then(|v| guard(v > 0).map(move |_| v));
    let mut interp = Interp::new(&NoopScheduler);
    assert!(matches!(interp.run(t.term.clone()), Outcome::Retry));

    // A writer slips in between the attempt and the park.
    atomically(a.set(1)).await;

    // Registration under the commit lock sees the version change and sends
    // the fiber back to re-run instead of parking it with no wakeup coming.
    let (handle, _receiver) = WakeHandle::pair(0);
    assert!(commit::park_candidate(&interp.journal, &handle).is_err());
    assert_eq!(a.raw.pending_todos(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_increments_serialize() {
    let counter = TRef::new(0i64);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = counter.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..100 {
                atomically(c.update(|n| n + 1)).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(atomically(counter.get()).await, 800);
}

mod laws {
    use super::*;
    use proptest::prelude::*;

    fn run<T: TxValue + PartialEq + std::fmt::Debug>(stm: Stm<T, Infallible>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(atomically(stm))
    }

    proptest! {
        #[test]
        fn flat_map_succeed_is_application(x in any::<i32>()) {
            let lhs = run(succeed::<i32, Infallible>(x).and_then(|v| succeed(v.wrapping_mul(3))));
            prop_assert_eq!(lhs, x.wrapping_mul(3));
        }

        #[test]
        fn or_else_retry_is_identity(x in any::<i32>()) {
            let v = run(retry::<i32, Infallible>().or_else(succeed(x)));
            prop_assert_eq!(v, x);
        }

        #[test]
        fn or_else_succeed_shortcuts(x in any::<i32>(), y in any::<i32>()) {
            let v = run(succeed::<i32, Infallible>(x).or_else(succeed(y)));
            prop_assert_eq!(v, x);
        }
    }
}
