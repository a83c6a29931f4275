//! Per-mailbox message quota.
//!
//! Admission is tiered:
//!
//! 1. A mailbox never holds more than `max_queued_messages`, whoever sends.
//! 2. While fewer than `unaccounted_messages` are queued, anything is
//!    admitted and nobody is charged.
//! 3. Past that window, each message is charged to its sending user, and a
//!    user may hold at most `max_messages_per_user` charged messages.
//!
//! Bus notifications have no user: they are bounded only by tier 1.
//!
//! The charge decision is recorded on the queued entry as a
//! [`Charge`], so a dequeue refunds exactly what the enqueue took even
//! though the mailbox total has moved since.

use std::collections::HashMap;

use crate::config::BusLimits;
use crate::message::UserId;

/// Who pays for a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    /// Admitted inside the unaccounted window, or a bus notification.
    Unaccounted,
    /// Charged to a sending user.
    User(UserId),
}

/// Why a message was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaRejection {
    /// The mailbox is at the global cap.
    QueueFull {
        /// Messages queued.
        queued: usize,
        /// Global cap.
        max: usize,
    },
    /// The sending user holds its full share.
    UserQuotaExceeded {
        /// Sending user.
        user: UserId,
        /// Messages charged to the user.
        charged: usize,
        /// Per-user cap.
        max: usize,
    },
}

/// Message-count ledger for one mailbox.
#[derive(Debug)]
pub struct QuotaLedger {
    max_queued: usize,
    unaccounted: usize,
    per_user: usize,
    total: usize,
    charged: HashMap<UserId, usize>,
}

impl QuotaLedger {
    /// Creates an empty ledger enforcing `limits`.
    #[must_use]
    pub fn new(limits: &BusLimits) -> Self {
        Self {
            max_queued: limits.max_queued_messages,
            unaccounted: limits.unaccounted_messages,
            per_user: limits.max_messages_per_user,
            total: 0,
            charged: HashMap::new(),
        }
    }

    /// Returns the number of messages admitted and not yet refunded.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Returns the messages currently charged to `user`.
    #[must_use]
    pub fn charged_to(&self, user: UserId) -> usize {
        self.charged.get(&user).copied().unwrap_or(0)
    }

    /// Checks whether a message from `sender` would be admitted, without
    /// recording anything.
    ///
    /// `sender` is `None` for bus notifications.
    ///
    /// # Errors
    ///
    /// Returns the [`QuotaRejection`] that [`QuotaLedger::admit`] would.
    pub fn check(&self, sender: Option<UserId>) -> Result<Charge, QuotaRejection> {
        if self.total >= self.max_queued {
            return Err(QuotaRejection::QueueFull {
                queued: self.total,
                max: self.max_queued,
            });
        }
        let Some(user) = sender else {
            return Ok(Charge::Unaccounted);
        };
        if self.total < self.unaccounted {
            return Ok(Charge::Unaccounted);
        }
        let charged = self.charged_to(user);
        if charged >= self.per_user {
            return Err(QuotaRejection::UserQuotaExceeded {
                user,
                charged,
                max: self.per_user,
            });
        }
        Ok(Charge::User(user))
    }

    /// Admits a message from `sender` and records its charge.
    ///
    /// # Errors
    ///
    /// Returns a [`QuotaRejection`]; the ledger is unchanged on error.
    pub fn admit(&mut self, sender: Option<UserId>) -> Result<Charge, QuotaRejection> {
        let charge = self.check(sender)?;
        self.total += 1;
        if let Charge::User(user) = charge {
            *self.charged.entry(user).or_insert(0) += 1;
        }
        Ok(charge)
    }

    /// Refunds a message previously admitted with `charge`.
    pub fn refund(&mut self, charge: Charge) {
        self.total = self.total.saturating_sub(1);
        if let Charge::User(user) = charge {
            if let Some(count) = self.charged.get_mut(&user) {
                *count -= 1;
                if *count == 0 {
                    self.charged.remove(&user);
                }
            }
        }
    }

    /// Forgets every charge.
    pub fn clear(&mut self) {
        self.total = 0;
        self.charged.clear();
    }
}
