use std::{mem, sync::Arc};

use crate::cell::DynValue;
use crate::journal::Journal;
use crate::sched::Scheduler;
use crate::term::{unit, ContFn, Defect, Term, TxEnv};

/// Result of interpreting one transaction attempt.
///
/// `Conflict` and `Interrupted` never reach transaction code: the first
/// re-runs the attempt from scratch, the second is routed back to the
/// scheduler.
pub(crate) enum Outcome {
    Success(DynValue),
    Failure(DynValue),
    Retry,
    Die(Defect),
    Conflict,
    Interrupted,
}

/// A continuation waiting for the term currently being interpreted.
enum Frame {
    /// `flat_map`: feed a success value into the continuation.
    AndThen(ContFn),
    /// `fold`: trap Failure as well as success; Retry and defects pass by.
    Fold { on_fail: ContFn, on_succeed: ContFn },
    /// `or_try`: if the branch below retries, restore the saved journal,
    /// keep the branch's read footprint and run the alternative.
    OrElse {
        alternative: Arc<Term>,
        saved: Journal,
    },
    /// `provide_env`: put the outer environment back while unwinding.
    RestoreEnv(TxEnv),
}

/// What the current term reduced to, before unwinding the stack.
enum Step {
    Succeeded(DynValue),
    Failed(DynValue),
    Retried,
    Died(Defect),
}

/// One transaction attempt: a fresh journal driven over a term.
///
/// The walk is iterative over an explicit continuation stack, so arbitrarily
/// nested terms never exhaust the host stack. The journal is re-validated
/// after every primitive that touches it; the first stale observation aborts
/// the attempt for an immediate re-run.
pub(crate) struct Interp<'a> {
    pub journal: Journal,
    env: TxEnv,
    sched: &'a dyn Scheduler,
}

impl<'a> Interp<'a> {
    pub fn new(sched: &'a dyn Scheduler) -> Interp<'a> {
        Interp {
            journal: Journal::new(),
            env: Arc::new(()),
            sched,
        }
    }

    pub fn run(&mut self, root: Term) -> Outcome {
        let mut stack: Vec<Frame> = Vec::new();
        let mut current = root;

        loop {
            // Deterministic cancellation checkpoint between primitives.
            if self.sched.is_cancelled() {
                return Outcome::Interrupted;
            }

            let step = match current {
                Term::Succeed(value) => Step::Succeeded(value),
                Term::Sync(f) => Step::Succeeded(f()),
                Term::Fail(error) => Step::Failed(error),
                Term::Retry => Step::Retried,
                Term::Die(defect) => Step::Died(defect),
                Term::Interrupt => Step::Died(Defect::interrupted()),
                Term::Read(cell) => {
                    let value = cell.unsafe_get(&mut self.journal);
                    if self.journal.is_invalid() {
                        return Outcome::Conflict;
                    }
                    Step::Succeeded(value)
                }
                Term::Write(cell, value) => {
                    cell.unsafe_set(&mut self.journal, value);
                    if self.journal.is_invalid() {
                        return Outcome::Conflict;
                    }
                    Step::Succeeded(unit())
                }
                Term::FlatMap(term, k) => {
                    stack.push(Frame::AndThen(k));
                    current = (*term).clone();
                    continue;
                }
                Term::Fold(term, on_fail, on_succeed) => {
                    stack.push(Frame::Fold {
                        on_fail,
                        on_succeed,
                    });
                    current = (*term).clone();
                    continue;
                }
                Term::OrTry(left, right) => {
                    stack.push(Frame::OrElse {
                        alternative: right,
                        saved: self.journal.clone(),
                    });
                    current = (*left).clone();
                    continue;
                }
                Term::ProvideEnv(env, term) => {
                    stack.push(Frame::RestoreEnv(mem::replace(&mut self.env, env)));
                    current = (*term).clone();
                    continue;
                }
                Term::WithEnv(f) => {
                    current = f(&self.env);
                    continue;
                }
            };

            current = match self.unwind(&mut stack, step) {
                Ok(next) => next,
                Err(outcome) => return outcome,
            };
        }
    }

    /// Pop frames until one resumes the walk, or the stack runs dry and the
    /// step becomes the attempt's outcome.
    fn unwind(&mut self, stack: &mut Vec<Frame>, mut step: Step) -> Result<Term, Outcome> {
        loop {
            match stack.pop() {
                None => {
                    return Err(match step {
                        Step::Succeeded(value) => Outcome::Success(value),
                        Step::Failed(error) => Outcome::Failure(error),
                        Step::Retried => Outcome::Retry,
                        Step::Died(defect) => Outcome::Die(defect),
                    })
                }
                Some(Frame::AndThen(k)) => match step {
                    Step::Succeeded(value) => return Ok(k(value)),
                    other => step = other,
                },
                Some(Frame::Fold {
                    on_fail,
                    on_succeed,
                }) => match step {
                    Step::Succeeded(value) => return Ok(on_succeed(value)),
                    Step::Failed(error) => return Ok(on_fail(error)),
                    other => step = other,
                },
                Some(Frame::OrElse { alternative, saved }) => match step {
                    Step::Retried => {
                        let attempted = mem::replace(&mut self.journal, saved);
                        self.journal.merge_reads(attempted);
                        return Ok((*alternative).clone());
                    }
                    other => step = other,
                },
                Some(Frame::RestoreEnv(env)) => {
                    self.env = env;
                }
            }
        }
    }
}
