//! Token-bucket rate limiting built on transactional variables.
//!
//! The limiter keeps its token count in a [`TVar`], so taking a token can be
//! composed into larger transactions with [`Limiter::allow_stm`], and blocked
//! callers wait on the bucket the same way any transaction waits on a
//! variable. The token count lives in a builtin-eq var: replenishing to an
//! unchanged count does not wake waiters.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use watch_stm::{atomically, guard, retry, StmClosureResult, TVar, Transaction};

/// Sustained rate of a limiter, in tokens per second.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug)]
pub struct Limit(f64);

impl Limit {
    /// The unlimited rate. A limiter with this rate always allows.
    pub const INF: Limit = Limit(f64::INFINITY);

    /// A rate of `n` tokens per second.
    pub fn per_second(n: f64) -> Limit {
        Limit(n)
    }

    /// The rate that replenishes one token every `interval`.
    ///
    /// A zero interval means no limit.
    pub fn every(interval: Duration) -> Limit {
        if interval.is_zero() {
            Limit::INF
        } else {
            Limit(1.0 / interval.as_secs_f64())
        }
    }

    /// Time between two tokens. Must not be called on `INF`.
    fn interval(self) -> Duration {
        Duration::from_secs_f64(1.0 / self.0)
    }
}

/// Error returned by the blocking wait calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The done var became true while waiting.
    #[error("wait cancelled")]
    Cancelled,

    /// More tokens were requested than the bucket can ever hold.
    #[error("requested tokens exceed the burst size")]
    BurstExceeded,

    /// The tokens cannot arrive before the deadline.
    #[error("tokens cannot arrive before the deadline")]
    DeadlineExceeded,
}

/// A token-bucket rate limiter.
///
/// Tokens replenish at a fixed [`Limit`] up to a burst size. Taking tokens is
/// transactional, so a take can be combined with other variables in one
/// atomic step.
pub struct Limiter {
    max: TVar<i64>,
    cur: TVar<i64>,
    last_add: TVar<Instant>,
    rate: Limit,
}

impl Limiter {
    /// Create a limiter replenishing `rate` tokens into a bucket of `burst`.
    ///
    /// The bucket starts full. A generator thread feeds the bucket for as
    /// long as the limiter is alive; it parks itself while the bucket is
    /// full.
    pub fn new(rate: Limit, burst: i64) -> Arc<Limiter> {
        let limiter = Arc::new(Limiter {
            max: TVar::new(burst),
            cur: TVar::new_builtin_eq(burst),
            last_add: TVar::new(Instant::now()),
            rate,
        });
        if rate != Limit::INF {
            let handle = Arc::downgrade(&limiter);
            thread::spawn(move || Limiter::generate_tokens(&handle, rate.interval()));
        }
        limiter
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Take `n` tokens if all of them are available, none otherwise.
    pub fn allow_n(&self, n: i64) -> bool {
        atomically(|tx| self.take_tokens(tx, n))
    }

    /// Composable form of [`Limiter::allow`]: take one token as part of a
    /// larger transaction.
    pub fn allow_stm(&self, tx: &mut Transaction) -> StmClosureResult<bool> {
        self.take_tokens(tx, 1)
    }

    /// Block until one token is taken, `done` becomes true or the deadline
    /// passes.
    pub fn wait(&self, done: &TVar<bool>, deadline: Option<Instant>) -> Result<(), WaitError> {
        self.wait_n(done, 1, deadline)
    }

    /// Block until `n` tokens are taken, `done` becomes true or the deadline
    /// passes.
    ///
    /// `done` is the cancellation hook: flip it with
    /// [`TVar::write_atomic`] to stop a pending wait from another thread.
    pub fn wait_n(
        &self,
        done: &TVar<bool>,
        n: i64,
        deadline: Option<Instant>,
    ) -> Result<(), WaitError> {
        atomically(|tx| {
            if done.read(tx)? {
                return Ok(Err(WaitError::Cancelled));
            }
            if self.take_tokens(tx, n)? {
                return Ok(Ok(()));
            }
            if n > self.max.read(tx)? {
                return Ok(Err(WaitError::BurstExceeded));
            }
            if let Some(deadline) = deadline {
                let pending = deadline
                    .saturating_duration_since(self.last_add.read(tx)?)
                    .as_nanos()
                    / self.rate.interval().as_nanos();
                #[allow(clippy::cast_possible_truncation)]
                if self.cur.read(tx)? + (pending as i64) < n {
                    return Ok(Err(WaitError::DeadlineExceeded));
                }
            }
            retry()
        })
    }

    fn take_tokens(&self, tx: &mut Transaction, n: i64) -> StmClosureResult<bool> {
        if self.rate == Limit::INF {
            return Ok(true);
        }
        let cur = self.cur.read(tx)?;
        if cur >= n {
            self.cur.write(tx, cur - n)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Body of the generator thread. Exits once the limiter is dropped.
    fn generate_tokens(handle: &Weak<Limiter>, interval: Duration) {
        loop {
            let Some(limiter) = handle.upgrade() else {
                return;
            };
            let last_add = limiter.last_add.read_atomic();
            // Don't keep the limiter alive while sleeping.
            drop(limiter);
            thread::sleep((last_add + interval).saturating_duration_since(Instant::now()));

            let Some(limiter) = handle.upgrade() else {
                return;
            };
            let now = Instant::now();
            #[allow(clippy::cast_possible_truncation)]
            let available = (now.duration_since(last_add).as_nanos() / interval.as_nanos()) as i64;
            if available < 1 {
                continue;
            }
            atomically(|tx| {
                let cur = limiter.cur.read(tx)?;
                let max = limiter.max.read(tx)?;
                guard(cur < max)?;
                let new_cur = (cur + available).min(max);
                if new_cur != cur {
                    limiter.cur.write(tx, new_cur)?;
                }
                #[allow(clippy::cast_precision_loss)]
                let advance = interval.mul_f64(available as f64);
                limiter.last_add.write(tx, last_add + advance)
            });
        }
    }
}
