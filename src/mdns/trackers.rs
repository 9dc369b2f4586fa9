//! Record and question trackers.
//!
//! A record tracker owns one cached record and its refresh/expiry
//! schedule; a question tracker owns one continuous question and its
//! exponential resend backoff. The trackers hold the state machines only;
//! the querier owns them, links them to each other by id, and drives them
//! from the task runner.

use crate::errors::{Error, Result};
use crate::message::{MdnsQuestion, MdnsRecord};
use std::time::{Duration, Instant};

pub type RecordTrackerId = u64;
pub type QuestionTrackerId = u64;

// RFC 6762 Section 5.2
// https://tools.ietf.org/html/rfc6762#section-5.2

/// Refresh attempts are performed at 80%, 85%, 90% and 95% of TTL; the
/// record expires at 100%.
pub const TTL_FRACTIONS: [f64; 5] = [0.80, 0.85, 0.90, 0.95, 1.00];

/// Intervals between successive queries must increase by at least a factor
/// of two.
pub const INTERVAL_INCREASE_FACTOR: u32 = 2;

/// The interval between any two queries for the same question must be at
/// least one second.
pub const MINIMUM_QUERY_INTERVAL: Duration = Duration::from_secs(1);

/// The querier caps the question refresh interval at 60 minutes.
pub const MAXIMUM_QUERY_INTERVAL: Duration = Duration::from_secs(60 * 60);

// RFC 6762 Section 10.1
// https://tools.ietf.org/html/rfc6762#section-10.1

/// The effective lifetime of a goodbye record is clamped to one second.
pub const GOODBYE_RECORD_TTL: Duration = Duration::from_secs(1);

/// Outcome of updating a tracked record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateType {
    /// The record has a TTL of 0 and will expire.
    Goodbye,
    /// The record updated its TTL only.
    TtlOnly,
    /// The record updated its RDATA.
    Rdata,
}

/// Tracks one cached record through TTL refresh and expiration.
pub struct MdnsRecordTracker {
    record: MdnsRecord,
    /// When the record was received and tracking (re)started.
    start_time: Instant,
    /// Number of refresh attempts so far, indexing [`TTL_FRACTIONS`].
    attempt_count: usize,
    /// Questions this record answers.
    associated_questions: Vec<QuestionTrackerId>,
}

impl MdnsRecordTracker {
    pub fn new(record: MdnsRecord, now: Instant) -> MdnsRecordTracker {
        MdnsRecordTracker {
            record,
            start_time: now,
            attempt_count: 0,
            associated_questions: Vec::new(),
        }
    }

    pub fn record(&self) -> &MdnsRecord {
        &self.record
    }

    pub fn associated_questions(&self) -> &[QuestionTrackerId] {
        &self.associated_questions
    }

    /// Updates the tracker with a newly received copy of the record.
    ///
    /// A valid update has the same name, type and class; a goodbye update
    /// must also carry identical RDATA (RFC 6762 section 10.1). On a
    /// goodbye the refresh counter jumps to its final slot and the TTL is
    /// clamped to one second. The tracker is unchanged on error.
    pub fn update(&mut self, new_record: &MdnsRecord, now: Instant) -> Result<UpdateType> {
        let has_same_rdata = self.record.rdata() == new_record.rdata();

        if !self.record.matches_key(new_record) || (new_record.is_goodbye() && !has_same_rdata) {
            // The new record has been passed to a wrong tracker.
            return Err(Error::ParameterInvalid(format!(
                "record '{}' is not an update of '{}'",
                new_record.name(),
                self.record.name()
            )));
        }

        let result = if new_record.is_goodbye() {
            self.record = new_record.with_ttl(GOODBYE_RECORD_TTL);

            // Goodbye records are not re-queried; jump to the final slot,
            // which is 100% of TTL, i.e. record expiration.
            self.attempt_count = TTL_FRACTIONS.len() - 1;
            UpdateType::Goodbye
        } else {
            self.record = new_record.clone();
            self.attempt_count = 0;
            if has_same_rdata {
                UpdateType::TtlOnly
            } else {
                UpdateType::Rdata
            }
        };

        self.start_time = now;
        Ok(result)
    }

    /// Converts the record to an effective one-second-lived goodbye.
    pub fn expire_soon(&mut self, now: Instant) {
        self.record = self.record.with_ttl(GOODBYE_RECORD_TTL);
        self.attempt_count = TTL_FRACTIONS.len() - 1;
        self.start_time = now;
    }

    /// True once half the TTL has elapsed. Used to gate known-answer
    /// suppression, RFC 6762 section 7.1.
    pub fn is_nearing_expiry(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start_time) > self.record.ttl() / 2
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.start_time + self.record.ttl()
    }

    /// The next time the refresh alarm should fire, consuming one attempt
    /// slot. `ttl_variation` spreads the refresh except at the expiration
    /// point.
    pub fn next_send_time(&mut self, ttl_variation: f64) -> Instant {
        debug_assert!(self.attempt_count < TTL_FRACTIONS.len());

        let mut ttl_fraction = TTL_FRACTIONS[self.attempt_count];
        self.attempt_count += 1;

        // Do not add random variation to the expiration time.
        if self.attempt_count != TTL_FRACTIONS.len() {
            ttl_fraction += ttl_variation;
        }

        self.start_time + self.record.ttl().mul_f64(ttl_fraction)
    }

    /// Links a question this record answers. Idempotent: returns false if
    /// the link already exists.
    pub fn add_associated_query(&mut self, question: QuestionTrackerId) -> bool {
        if self.associated_questions.contains(&question) {
            return false;
        }
        self.associated_questions.push(question);
        true
    }

    pub fn remove_associated_query(&mut self, question: QuestionTrackerId) -> bool {
        match self.associated_questions.iter().position(|&q| q == question) {
            Some(index) => {
                self.associated_questions.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Tracks one continuous question and its resend backoff.
pub struct MdnsQuestionTracker {
    question: MdnsQuestion,
    /// Delay between the currently scheduled and the next queries.
    send_delay: Duration,
    last_send_time: Option<Instant>,
    /// Records answering this question.
    associated_records: Vec<RecordTrackerId>,
    is_continuous: bool,
}

impl MdnsQuestionTracker {
    pub fn new(question: MdnsQuestion, is_continuous: bool) -> MdnsQuestionTracker {
        MdnsQuestionTracker {
            question,
            send_delay: MINIMUM_QUERY_INTERVAL,
            last_send_time: None,
            associated_records: Vec::new(),
            is_continuous,
        }
    }

    pub fn question(&self) -> &MdnsQuestion {
        &self.question
    }

    pub fn is_continuous(&self) -> bool {
        self.is_continuous
    }

    pub fn associated_records(&self) -> &[RecordTrackerId] {
        &self.associated_records
    }

    /// Whether a send now would respect the one-second floor between
    /// queries for the same question.
    pub fn can_send(&self, now: Instant) -> bool {
        match self.last_send_time {
            Some(last) => now >= last + MINIMUM_QUERY_INTERVAL,
            None => true,
        }
    }

    pub fn record_send(&mut self, now: Instant) {
        self.last_send_time = Some(now);
    }

    /// The delay until the next periodic resend; doubles after each call,
    /// capped at 60 minutes.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.send_delay;
        self.send_delay = (self.send_delay * INTERVAL_INCREASE_FACTOR).min(MAXIMUM_QUERY_INTERVAL);
        delay
    }

    /// Links a record answering this question. Idempotent.
    pub fn add_associated_record(&mut self, record: RecordTrackerId) -> bool {
        if self.associated_records.contains(&record) {
            return false;
        }
        self.associated_records.push(record);
        true
    }

    pub fn remove_associated_record(&mut self, record: RecordTrackerId) -> bool {
        match self.associated_records.iter().position(|&r| r == record) {
            Some(index) => {
                self.associated_records.remove(index);
                true
            }
            None => false,
        }
    }
}
