//! The mDNS querier: cached records, continuous questions, and
//! record-change fan-out to subscribers.

use crate::clock::Clock;
use crate::mdns::random::MdnsRandom;
use crate::mdns::socket::MdnsSender;
use crate::mdns::trackers::*;
use crate::message::{MdnsMessage, MdnsQuestion, MdnsRecord};
use crate::name::DomainName;
use crate::runner::TaskRunner;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Subscriber callback. Wrapped in a mutex so the querier can invoke it
/// without holding its own state lock; re-entrant calls back into the
/// querier are safe.
pub type RecordCallback = Arc<Mutex<dyn FnMut(&MdnsRecord, RecordChangedEvent) + Send>>;

type Dispatch = (RecordCallback, MdnsRecord, RecordChangedEvent);

struct CallbackInfo {
    id: u64,
    dns_type: DnsType,
    dns_class: DnsClass,
    callback: RecordCallback,
}

struct TrackedRecord {
    tracker: MdnsRecordTracker,
    // Invalidates superseded alarm tasks.
    generation: u64,
}

struct TrackedQuestion {
    tracker: MdnsQuestionTracker,
    generation: u64,
}

struct QuerierInner {
    sender: MdnsSender,
    runner: TaskRunner,
    clock: Arc<dyn Clock>,
    random: MdnsRandom,
    records: HashMap<RecordTrackerId, TrackedRecord>,
    records_by_name: HashMap<DomainName, Vec<RecordTrackerId>>,
    questions: HashMap<QuestionTrackerId, TrackedQuestion>,
    questions_by_name: HashMap<DomainName, Vec<QuestionTrackerId>>,
    callbacks: HashMap<DomainName, Vec<CallbackInfo>>,
    next_id: u64,
}

impl QuerierInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn matching_callbacks(&self, record: &MdnsRecord, event: RecordChangedEvent) -> Vec<Dispatch> {
        let mut pending = Vec::new();
        if let Some(callbacks) = self.callbacks.get(record.name()) {
            for info in callbacks {
                if (info.dns_type == DnsType::ANY || info.dns_type == record.dns_type())
                    && (info.dns_class == DnsClass::Any || info.dns_class == record.dns_class())
                {
                    pending.push((info.callback.clone(), record.clone(), event));
                }
            }
        }
        pending
    }

    fn find_question(
        &self,
        name: &DomainName,
        dns_type: DnsType,
        dns_class: DnsClass,
    ) -> Option<QuestionTrackerId> {
        self.questions_by_name.get(name)?.iter().copied().find(|id| {
            let question = self.questions[id].tracker.question();
            question.dns_type == dns_type && question.dns_class == dns_class
        })
    }
}

fn question_answers_record(question: &MdnsQuestion, record: &MdnsRecord) -> bool {
    question.name == *record.name()
        && (question.dns_type == DnsType::ANY || question.dns_type == record.dns_type())
        && (question.dns_class == DnsClass::Any || question.dns_class == record.dns_class())
}

/// Continuously queries for records and caches the results.
///
/// Subscribers are registered per (name, type, class); `DnsType::ANY` and
/// `DnsClass::Any` match any record. Cached records matching a new
/// subscription are replayed to it as Created events. Each unique
/// (name, type, class) triple drives one continuous question tracker.
#[derive(Clone)]
pub struct MdnsQuerier {
    inner: Arc<Mutex<QuerierInner>>,
}

impl MdnsQuerier {
    pub fn new(
        sender: MdnsSender,
        runner: TaskRunner,
        clock: Arc<dyn Clock>,
        random: MdnsRandom,
    ) -> MdnsQuerier {
        MdnsQuerier {
            inner: Arc::new(Mutex::new(QuerierInner {
                sender,
                runner,
                clock,
                random,
                records: HashMap::new(),
                records_by_name: HashMap::new(),
                questions: HashMap::new(),
                questions_by_name: HashMap::new(),
                callbacks: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Registers `callback` for changes to records matching the filter and
    /// returns its subscription id. Cached records are replayed to the new
    /// callback as Created events on the task runner. Registering the same
    /// callback twice for one filter is a no-op.
    pub fn start_query(
        &self,
        name: &DomainName,
        dns_type: DnsType,
        dns_class: DnsClass,
        callback: RecordCallback,
    ) -> u64 {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.callbacks.get(name).and_then(|callbacks| {
            callbacks
                .iter()
                .find(|info| {
                    info.dns_type == dns_type
                        && info.dns_class == dns_class
                        && Arc::ptr_eq(&info.callback, &callback)
                })
                .map(|info| info.id)
        }) {
            return existing;
        }

        let id = inner.next_id();
        inner.callbacks.entry(name.clone()).or_default().push(CallbackInfo {
            id,
            dns_type,
            dns_class,
            callback,
        });

        // Replay previously cached records. Posted rather than dispatched
        // inline: the caller may be running inside another subscriber.
        let querier = self.clone();
        let replay_name = name.clone();
        inner.runner.post_task(move || {
            querier.replay_cached_records(replay_name, dns_type, dns_class, id)
        });

        // Add a new question if we haven't seen this triple before.
        if inner.find_question(name, dns_type, dns_class).is_none() {
            self.add_question(
                &mut inner,
                MdnsQuestion::new(name.clone(), dns_type, dns_class, ResponseType::Multicast),
            );
        }

        id
    }

    /// Removes a subscription. The question tracker is destroyed when no
    /// callbacks for its triple remain. After this returns no further
    /// callbacks fire for the subscription.
    pub fn stop_query(
        &self,
        name: &DomainName,
        dns_type: DnsType,
        dns_class: DnsClass,
        callback_id: u64,
    ) {
        let mut inner = self.inner.lock();

        let Some(callbacks) = inner.callbacks.get_mut(name) else {
            return;
        };
        let before = callbacks.len();
        callbacks.retain(|info| {
            !(info.id == callback_id && info.dns_type == dns_type && info.dns_class == dns_class)
        });
        if callbacks.len() == before {
            return;
        }

        let remaining = callbacks
            .iter()
            .any(|info| info.dns_type == dns_type && info.dns_class == dns_class);
        let now_empty = callbacks.is_empty();
        if now_empty {
            inner.callbacks.remove(name);
        }
        if remaining {
            return;
        }

        if let Some(qid) = inner.find_question(name, dns_type, dns_class) {
            self.remove_question(&mut inner, qid);
        }
    }

    /// Feeds a received response message into the cache, producing
    /// Created/Updated/Expired events for subscribers.
    pub fn on_message_received(&self, message: &MdnsMessage) {
        debug_assert_eq!(message.msg_type, MessageType::Response);

        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            for record in message.answers.iter().chain(message.additional_records.iter()) {
                match record.record_type() {
                    RecordType::Shared => self.process_shared(&mut inner, record, &mut pending),
                    RecordType::Unique => self.process_unique(&mut inner, record, &mut pending),
                }
            }
        }
        dispatch(pending);
    }

    fn replay_cached_records(
        &self,
        name: DomainName,
        dns_type: DnsType,
        dns_class: DnsClass,
        callback_id: u64,
    ) {
        let mut pending = Vec::new();
        {
            let inner = self.inner.lock();
            let Some(callback) = inner.callbacks.get(&name).and_then(|callbacks| {
                callbacks
                    .iter()
                    .find(|info| info.id == callback_id)
                    .map(|info| info.callback.clone())
            }) else {
                return; // Cancelled before the replay ran.
            };

            if let Some(ids) = inner.records_by_name.get(&name) {
                for id in ids {
                    let record = inner.records[id].tracker.record();
                    if (dns_type == DnsType::ANY || dns_type == record.dns_type())
                        && (dns_class == DnsClass::Any || dns_class == record.dns_class())
                    {
                        pending.push((callback.clone(), record.clone(), RecordChangedEvent::Created));
                    }
                }
            }
        }
        dispatch(pending);
    }

    fn add_question(&self, inner: &mut QuerierInner, question: MdnsQuestion) {
        let qid = inner.next_id();
        let mut tracker = MdnsQuestionTracker::new(question, true);

        // Link to already-cached records that answer this question.
        if let Some(ids) = inner.records_by_name.get(&tracker.question().name).cloned() {
            for rid in ids {
                let entry = inner.records.get_mut(&rid).unwrap();
                if question_answers_record(tracker.question(), entry.tracker.record()) {
                    tracker.add_associated_record(rid);
                    entry.tracker.add_associated_query(qid);
                }
            }
        }

        let name = tracker.question().name.clone();
        inner.questions.insert(
            qid,
            TrackedQuestion {
                tracker,
                generation: 0,
            },
        );
        inner.questions_by_name.entry(name).or_default().push(qid);

        // The initial query is delayed by 20-120 ms, RFC 6762 section 5.2.
        let delay = inner.random.initial_query_delay();
        self.schedule_question_alarm(inner, qid, delay);
    }

    fn remove_question(&self, inner: &mut QuerierInner, qid: QuestionTrackerId) {
        let Some(entry) = inner.questions.remove(&qid) else {
            return;
        };
        let name = entry.tracker.question().name.clone();
        if let Some(ids) = inner.questions_by_name.get_mut(&name) {
            ids.retain(|&id| id != qid);
            if ids.is_empty() {
                inner.questions_by_name.remove(&name);
            }
        }
        for rid in entry.tracker.associated_records() {
            if let Some(record) = inner.records.get_mut(rid) {
                record.tracker.remove_associated_query(qid);
            }
        }
    }

    fn schedule_question_alarm(
        &self,
        inner: &mut QuerierInner,
        qid: QuestionTrackerId,
        delay: std::time::Duration,
    ) {
        let Some(entry) = inner.questions.get_mut(&qid) else {
            return;
        };
        entry.generation += 1;
        let generation = entry.generation;
        let querier = self.clone();
        inner
            .runner
            .post_task_with_delay(move || querier.on_question_alarm(qid, generation), delay);
    }

    fn on_question_alarm(&self, qid: QuestionTrackerId, generation: u64) {
        let mut inner = self.inner.lock();
        match inner.questions.get(&qid) {
            Some(entry) if entry.generation == generation => {}
            _ => return,
        }
        self.send_question(&mut inner, qid, false);
    }

    /// Sends the question with known-answer suppression, splitting into
    /// truncated continuation messages as needed. On-demand sends inside
    /// the one-second window are dropped; periodic sends reschedule.
    fn send_question(&self, inner: &mut QuerierInner, qid: QuestionTrackerId, on_demand: bool) {
        let now = inner.clock.now();

        let (question, associated, can_send) = {
            let Some(entry) = inner.questions.get_mut(&qid) else {
                return;
            };
            let can_send = entry.tracker.can_send(now);
            if can_send {
                entry.tracker.record_send(now);
            }
            (
                entry.tracker.question().clone(),
                entry.tracker.associated_records().to_vec(),
                can_send,
            )
        };

        if can_send {
            let mut message = MdnsMessage::new(MdnsMessage::random_id(), MessageType::Query);
            message.add_question(question);

            let mut index = 0;
            while index < associated.len() {
                let Some(entry) = inner.records.get(&associated[index]) else {
                    index += 1;
                    continue;
                };
                // Answers nearing expiry are about to be refreshed, so they
                // are not suppressed, RFC 6762 section 7.1.
                if entry.tracker.is_nearing_expiry(now) {
                    index += 1;
                    continue;
                }

                let record = entry.tracker.record().clone();
                if message.can_add_record(&record) {
                    message.add_answer(record);
                    index += 1;
                } else if message.questions.is_empty() && message.answers.is_empty() {
                    // A single record too large to fit in its own message is
                    // a spec violation by the peer. RFC 6762 would split
                    // further; this engine logs and skips the suppression.
                    log::warn!(
                        "record for '{}' too large for known-answer suppression; skipping",
                        entry.tracker.record().name()
                    );
                    index += 1;
                } else {
                    message.set_truncated();
                    inner.sender.send_multicast(&message);
                    message = MdnsMessage::new(MdnsMessage::random_id(), MessageType::Query);
                }
            }
            inner.sender.send_multicast(&message);
        } else if on_demand {
            return;
        }

        if !on_demand {
            let delay = {
                let Some(entry) = inner.questions.get_mut(&qid) else {
                    return;
                };
                if !entry.tracker.is_continuous() {
                    return;
                }
                entry.tracker.next_delay()
            };
            self.schedule_question_alarm(inner, qid, delay);
        }
    }

    fn process_shared(
        &self,
        inner: &mut QuerierInner,
        record: &MdnsRecord,
        pending: &mut Vec<Dispatch>,
    ) {
        debug_assert_eq!(record.record_type(), RecordType::Shared);

        let existing = inner.records_by_name.get(record.name()).and_then(|ids| {
            ids.iter().copied().find(|id| {
                let tracked = inner.records[id].tracker.record();
                tracked.matches_key(record) && tracked.rdata() == record.rdata()
            })
        });

        match existing {
            Some(rid) => {
                // Already have this shared record; a TTL-only update with
                // no notification.
                self.update_record(inner, rid, record);
            }
            None => {
                self.add_record(inner, record.clone());
                pending.extend(inner.matching_callbacks(record, RecordChangedEvent::Created));
            }
        }
    }

    fn process_unique(
        &self,
        inner: &mut QuerierInner,
        record: &MdnsRecord,
        pending: &mut Vec<Dispatch>,
    ) {
        debug_assert_eq!(record.record_type(), RecordType::Unique);

        let matching: Vec<RecordTrackerId> = inner
            .records_by_name
            .get(record.name())
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| inner.records[id].tracker.record().matches_key(record))
                    .collect()
            })
            .unwrap_or_default();

        match matching.len() {
            0 => {
                self.add_record(inner, record.clone());
                pending.extend(inner.matching_callbacks(record, RecordChangedEvent::Created));
            }
            1 => {
                let rid = matching[0];
                let is_updated = inner.records[&rid].tracker.record().rdata() != record.rdata();
                self.update_record(inner, rid, record);
                if is_updated {
                    pending.extend(inner.matching_callbacks(record, RecordChangedEvent::Updated));
                }
            }
            _ => {
                // Multiple records with the same key: expire every record
                // with non-matching RDATA and update the matching one if it
                // exists.
                let mut is_updated = false;
                for rid in matching {
                    if inner.records[&rid].tracker.record().rdata() == record.rdata() {
                        is_updated = true;
                        self.update_record(inner, rid, record);
                    } else {
                        self.expire_record_soon(inner, rid);
                    }
                }
                if !is_updated {
                    self.add_record(inner, record.clone());
                    pending.extend(inner.matching_callbacks(record, RecordChangedEvent::Created));
                }
            }
        }
    }

    fn add_record(&self, inner: &mut QuerierInner, record: MdnsRecord) {
        let now = inner.clock.now();
        let rid = inner.next_id();
        let mut tracker = MdnsRecordTracker::new(record, now);

        // Link to questions this record answers.
        if let Some(qids) = inner.questions_by_name.get(tracker.record().name()).cloned() {
            for qid in qids {
                let entry = inner.questions.get_mut(&qid).unwrap();
                if question_answers_record(entry.tracker.question(), tracker.record()) {
                    entry.tracker.add_associated_record(rid);
                    tracker.add_associated_query(qid);
                }
            }
        }

        let name = tracker.record().name().clone();
        inner.records.insert(
            rid,
            TrackedRecord {
                tracker,
                generation: 0,
            },
        );
        inner.records_by_name.entry(name).or_default().push(rid);
        self.schedule_record_alarm(inner, rid);
    }

    fn update_record(&self, inner: &mut QuerierInner, rid: RecordTrackerId, record: &MdnsRecord) {
        let now = inner.clock.now();
        let Some(entry) = inner.records.get_mut(&rid) else {
            return;
        };
        match entry.tracker.update(record, now) {
            Ok(_) => self.schedule_record_alarm(inner, rid),
            Err(e) => log::warn!("invalid record update for '{}': {}", record.name(), e),
        }
    }

    fn expire_record_soon(&self, inner: &mut QuerierInner, rid: RecordTrackerId) {
        let now = inner.clock.now();
        let Some(entry) = inner.records.get_mut(&rid) else {
            return;
        };
        entry.tracker.expire_soon(now);
        self.schedule_record_alarm(inner, rid);
    }

    fn schedule_record_alarm(&self, inner: &mut QuerierInner, rid: RecordTrackerId) {
        let now = inner.clock.now();
        let variation = inner.random.record_ttl_variation();
        let Some(entry) = inner.records.get_mut(&rid) else {
            return;
        };
        entry.generation += 1;
        let generation = entry.generation;
        let when = entry.tracker.next_send_time(variation);
        let querier = self.clone();
        inner.runner.post_task_with_delay(
            move || querier.on_record_alarm(rid, generation),
            when.saturating_duration_since(now),
        );
    }

    fn on_record_alarm(&self, rid: RecordTrackerId, generation: u64) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = inner.clock.now();

            let expired = match inner.records.get(&rid) {
                Some(entry) if entry.generation == generation => entry.tracker.is_expired(now),
                _ => return,
            };

            if expired {
                let entry = inner.records.remove(&rid).unwrap();
                let record = entry.tracker.record().clone();
                if let Some(ids) = inner.records_by_name.get_mut(record.name()) {
                    ids.retain(|&id| id != rid);
                    if ids.is_empty() {
                        inner.records_by_name.remove(record.name());
                    }
                }
                for qid in entry.tracker.associated_questions() {
                    if let Some(question) = inner.questions.get_mut(qid) {
                        question.tracker.remove_associated_record(rid);
                    }
                }
                pending = inner.matching_callbacks(&record, RecordChangedEvent::Expired);
            } else {
                // A refresh point: ask the associated questions to requery.
                let qids = inner.records[&rid].tracker.associated_questions().to_vec();
                for qid in qids {
                    self.send_question(&mut inner, qid, true);
                }
                self.schedule_record_alarm(&mut inner, rid);
            }
        }
        dispatch(pending);
    }
}

fn dispatch(pending: Vec<Dispatch>) {
    for (callback, record, event) in pending {
        (&mut *callback.lock())(&record, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::mdns::socket::testing::fake_sender;
    use crate::resource::Rdata;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    struct Harness {
        querier: MdnsQuerier,
        runner: TaskRunner,
        clock: FakeClock,
        socket: Arc<crate::mdns::socket::testing::FakeSocket>,
        events: Arc<Mutex<Vec<(MdnsRecord, RecordChangedEvent)>>>,
    }

    fn harness() -> Harness {
        let clock = FakeClock::new();
        let runner = TaskRunner::new(Arc::new(clock.clone()));
        let (sender, socket) = fake_sender();
        let querier = MdnsQuerier::new(sender, runner.clone(), Arc::new(clock.clone()), MdnsRandom);
        Harness {
            querier,
            runner,
            clock,
            socket,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    impl Harness {
        fn callback(&self) -> RecordCallback {
            let events = self.events.clone();
            Arc::new(Mutex::new(move |record: &MdnsRecord, event: RecordChangedEvent| {
                events.lock().push((record.clone(), event));
            }))
        }

        fn pump(&self, advance: Duration) {
            self.clock.advance(advance);
            self.runner.run_tasks_until_idle();
        }
    }

    fn a_record(name: &str, ip: [u8; 4], ttl: Duration) -> MdnsRecord {
        MdnsRecord::new(
            DomainName::from_str(name).unwrap(),
            DnsClass::Internet,
            RecordType::Unique,
            ttl,
            Rdata::A(Ipv4Addr::from(ip)),
        )
    }

    fn response(records: Vec<MdnsRecord>) -> MdnsMessage {
        let mut m = MdnsMessage::new(0, MessageType::Response);
        for record in records {
            m.add_answer(record);
        }
        m
    }

    #[test]
    fn start_query_sends_initial_question() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        h.querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());

        // Nothing goes out before the randomized 20-120 ms delay.
        h.runner.run_tasks_until_idle();
        assert!(h.socket.take_messages().is_empty());

        h.pump(Duration::from_millis(120));
        let sent = h.socket.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.questions.len(), 1);
        assert_eq!(sent[0].0.questions[0].name, name);
    }

    #[test]
    fn response_creates_record_and_notifies() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        h.querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());

        let record = a_record("host.local", [10, 0, 0, 1], Duration::from_secs(120));
        h.querier.on_message_received(&response(vec![record.clone()]));

        let events = h.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, record);
        assert_eq!(events[0].1, RecordChangedEvent::Created);
    }

    #[test]
    fn cached_records_replayed_to_late_subscriber() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        h.querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());
        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 1],
            Duration::from_secs(120),
        )]));
        h.events.lock().clear();

        let late_events = Arc::new(Mutex::new(Vec::new()));
        let sink = late_events.clone();
        let late: RecordCallback = Arc::new(Mutex::new(
            move |record: &MdnsRecord, event: RecordChangedEvent| {
                sink.lock().push((record.clone(), event));
            },
        ));
        h.querier.start_query(&name, DnsType::ANY, DnsClass::Any, late);
        h.runner.run_tasks_until_idle();

        let events = late_events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, RecordChangedEvent::Created);
    }

    #[test]
    fn unique_record_rdata_change_notifies_updated() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        h.querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());

        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 1],
            Duration::from_secs(120),
        )]));
        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 2],
            Duration::from_secs(120),
        )]));

        let events = h.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1, RecordChangedEvent::Updated);
        assert_eq!(
            events[1].0.rdata(),
            &Rdata::A(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[test]
    fn record_expires_at_ttl_and_notifies_once() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        h.querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());
        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 1],
            Duration::from_secs(100),
        )]));
        h.events.lock().clear();

        // Step through the refresh points and past the TTL.
        h.pump(Duration::from_secs(130));
        let expired: Vec<_> = h
            .events
            .lock()
            .iter()
            .filter(|(_, e)| *e == RecordChangedEvent::Expired)
            .cloned()
            .collect();
        assert_eq!(expired.len(), 1);

        // Long after, no further events arrive.
        h.events.lock().clear();
        h.pump(Duration::from_secs(7200));
        assert!(h.events.lock().is_empty());
    }

    #[test]
    fn goodbye_record_expires_in_one_second() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        h.querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());
        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 1],
            Duration::from_secs(4500),
        )]));
        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 1],
            Duration::ZERO,
        )]));
        h.events.lock().clear();

        h.pump(Duration::from_secs(1));
        let events = h.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, RecordChangedEvent::Expired);
    }

    #[test]
    fn stop_query_cancels_callbacks() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        let id = h
            .querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());
        h.querier.stop_query(&name, DnsType::A, DnsClass::Internet, id);

        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 1],
            Duration::from_secs(120),
        )]));
        h.runner.run_tasks_until_idle();
        assert!(h.events.lock().is_empty());
    }

    #[test]
    fn periodic_resend_includes_known_answers() {
        let h = harness();
        let name = DomainName::from_str("host.local").unwrap();
        h.querier
            .start_query(&name, DnsType::A, DnsClass::Internet, h.callback());
        h.pump(Duration::from_millis(120)); // initial query
        h.socket.take_messages();

        h.querier.on_message_received(&response(vec![a_record(
            "host.local",
            [10, 0, 0, 1],
            Duration::from_secs(4500),
        )]));

        // The next periodic resend happens ~1s after the first; the cached
        // answer is fresh, so it is suppressed into the query.
        h.pump(Duration::from_secs(2));
        let sent = h.socket.take_messages();
        assert!(!sent.is_empty());
        let query = &sent[0].0;
        assert_eq!(query.questions.len(), 1);
        assert_eq!(query.answers.len(), 1);
        assert_eq!(query.answers[0].name(), &name);
    }
}
