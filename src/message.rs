//! mDNS message framing: records, questions, and the message parser and
//! writer, as defined by [rfc1035] with the [rfc6762] extensions.
//!
//! [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
//! [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762

use crate::bail;
use crate::io::{DnsReadExt, SeekExt};
use crate::name::DomainName;
use crate::resource::Rdata;
use crate::types::*;
use byteorder::{ReadBytesExt, BE};
use num_traits::FromPrimitive;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io;
use std::io::Cursor;
use std::time::Duration;

/// A single resource record. The DNS type is implied by the RDATA variant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MdnsRecord {
    name: DomainName,
    dns_class: DnsClass,
    record_type: RecordType,
    ttl: Duration,
    rdata: Rdata,
}

impl MdnsRecord {
    pub fn new(
        name: DomainName,
        dns_class: DnsClass,
        record_type: RecordType,
        ttl: Duration,
        rdata: Rdata,
    ) -> MdnsRecord {
        MdnsRecord {
            name,
            dns_class,
            record_type,
            ttl,
            rdata,
        }
    }

    pub fn name(&self) -> &DomainName {
        &self.name
    }

    pub fn dns_type(&self) -> DnsType {
        self.rdata.dns_type()
    }

    pub fn dns_class(&self) -> DnsClass {
        self.dns_class
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn rdata(&self) -> &Rdata {
        &self.rdata
    }

    /// A goodbye record announces immediate departure with a TTL of zero,
    /// [rfc6762] section 10.1.
    ///
    /// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
    pub fn is_goodbye(&self) -> bool {
        self.ttl == Duration::ZERO
    }

    /// The same record with a different TTL.
    pub fn with_ttl(&self, ttl: Duration) -> MdnsRecord {
        MdnsRecord { ttl, ..self.clone() }
    }

    /// True when `other` names the same cache entry: same name, type and
    /// class. TTL and RDATA may differ.
    pub fn matches_key(&self, other: &MdnsRecord) -> bool {
        self.name == other.name
            && self.dns_type() == other.dns_type()
            && self.dns_class == other.dns_class
    }

    /// Upper bound for the serialized size of this record.
    pub fn max_wire_size(&self) -> usize {
        // name + type + class + ttl + rdata (incl. its length field)
        self.name.wire_size() + 8 + self.rdata.max_wire_size()
    }

    fn write(&self, w: &mut NameWriter) -> io::Result<()> {
        w.write_name(&self.name)?;
        w.push_u16(self.dns_type() as u16);
        let mut class = self.dns_class as u16;
        if self.record_type == RecordType::Unique {
            class |= CACHE_FLUSH_BIT;
        }
        w.push_u16(class);
        w.push_u32(self.ttl.as_secs().min(u32::MAX as u64) as u32);
        self.rdata.write(w)
    }
}

/// Records order by class value, then type value, then raw RDATA bytes.
/// This is the comparison used for simultaneous probe tiebreaking,
/// [rfc6762] section 8.2.1.
///
/// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
impl Ord for MdnsRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.dns_class as u16)
            .cmp(&(other.dns_class as u16))
            .then_with(|| (self.dns_type() as u16).cmp(&(other.dns_type() as u16)))
            .then_with(|| {
                self.rdata
                    .to_uncompressed_bytes()
                    .cmp(&other.rdata.to_uncompressed_bytes())
            })
    }
}

impl PartialOrd for MdnsRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A question, optionally requesting a unicast response.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MdnsQuestion {
    pub name: DomainName,
    pub dns_type: DnsType,
    pub dns_class: DnsClass,
    pub response_type: ResponseType,
}

impl MdnsQuestion {
    pub fn new(
        name: DomainName,
        dns_type: DnsType,
        dns_class: DnsClass,
        response_type: ResponseType,
    ) -> MdnsQuestion {
        MdnsQuestion {
            name,
            dns_type,
            dns_class,
            response_type,
        }
    }

    pub fn max_wire_size(&self) -> usize {
        self.name.wire_size() + 4
    }

    fn write(&self, w: &mut NameWriter) -> io::Result<()> {
        w.write_name(&self.name)?;
        w.push_u16(self.dns_type as u16);
        let mut class = self.dns_class as u16;
        if self.response_type == ResponseType::Unicast {
            class |= UNICAST_RESPONSE_BIT;
        }
        w.push_u16(class);
        Ok(())
    }
}

/// An mDNS message.
#[derive(Clone, Debug, PartialEq)]
pub struct MdnsMessage {
    pub id: u16,
    pub msg_type: MessageType,
    pub truncated: bool,
    pub questions: Vec<MdnsQuestion>,
    pub answers: Vec<MdnsRecord>,
    pub authority_records: Vec<MdnsRecord>,
    pub additional_records: Vec<MdnsRecord>,
}

impl MdnsMessage {
    pub fn new(id: u16, msg_type: MessageType) -> MdnsMessage {
        MdnsMessage {
            id,
            msg_type,
            truncated: false,
            questions: Vec::new(),
            answers: Vec::new(),
            authority_records: Vec::new(),
            additional_records: Vec::new(),
        }
    }

    /// Returns a random u16 suitable for the message id field. Multicast
    /// responses use id 0, [rfc6762] section 18.1; queries may use any id.
    ///
    /// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
    pub fn random_id() -> u16 {
        rand::thread_rng().gen()
    }

    pub fn add_question(&mut self, question: MdnsQuestion) {
        self.questions.push(question);
    }

    pub fn add_answer(&mut self, record: MdnsRecord) {
        self.answers.push(record);
    }

    pub fn add_authority_record(&mut self, record: MdnsRecord) {
        self.authority_records.push(record);
    }

    pub fn add_additional_record(&mut self, record: MdnsRecord) {
        self.additional_records.push(record);
    }

    pub fn set_truncated(&mut self) {
        self.truncated = true;
    }

    /// Whether `record` still fits under the multicast payload limit.
    pub fn can_add_record(&self, record: &MdnsRecord) -> bool {
        self.max_wire_size() + record.max_wire_size() <= MAX_MULTICAST_MESSAGE_SIZE
    }

    /// Upper bound for the serialized size of this message.
    pub fn max_wire_size(&self) -> usize {
        let records = self
            .answers
            .iter()
            .chain(self.authority_records.iter())
            .chain(self.additional_records.iter());
        12 + self
            .questions
            .iter()
            .map(MdnsQuestion::max_wire_size)
            .sum::<usize>()
            + records.map(MdnsRecord::max_wire_size).sum::<usize>()
    }

    /// Decodes the supplied buffer.
    pub fn from_slice(buf: &[u8]) -> io::Result<MdnsMessage> {
        MessageParser::new(buf).parse()
    }

    /// Encodes this message ready to be sent.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        let mut w = NameWriter::new();

        w.push_u16(self.id);

        let mut flags: u16 = 0;
        if self.msg_type.to_bool() {
            flags |= 0x8000; // QR
            flags |= 0x0400; // AA, required on responses per rfc6762 §18.4
        }
        if self.truncated {
            flags |= 0x0200; // TC
        }
        w.push_u16(flags);

        w.push_u16(self.questions.len() as u16);
        w.push_u16(self.answers.len() as u16);
        w.push_u16(self.authority_records.len() as u16);
        w.push_u16(self.additional_records.len() as u16);

        for question in &self.questions {
            question.write(&mut w)?;
        }
        for record in &self.answers {
            record.write(&mut w)?;
        }
        for record in &self.authority_records {
            record.write(&mut w)?;
        }
        for record in &self.additional_records {
            record.write(&mut w)?;
        }

        Ok(w.into_bytes())
    }
}

#[derive(Copy, Clone, PartialEq)]
enum RecordSection {
    Answers,
    Authorities,
    Additionals,
}

/// A helper to hold state while the parsing is happening.
struct MessageParser<'a> {
    cur: Cursor<&'a [u8]>,

    m: MdnsMessage,
}

impl<'a> MessageParser<'a> {
    fn new(buf: &[u8]) -> MessageParser {
        MessageParser {
            cur: Cursor::new(buf),
            m: MdnsMessage::new(0, MessageType::Query),
        }
    }

    /// Consume the [`MessageParser`] and return the resulting message.
    fn parse(mut self) -> io::Result<MdnsMessage> {
        self.m.id = self.cur.read_u16::<BE>()?;

        let flags = self.cur.read_u16::<BE>()?;
        self.m.msg_type = MessageType::from_bool(flags & 0x8000 != 0);
        self.m.truncated = flags & 0x0200 != 0;

        // Messages with a non-zero opcode or rcode must be silently
        // ignored, rfc6762 §18.3 and §18.11.
        let opcode = (flags >> 11) & 0xF;
        let rcode = flags & 0xF;
        if opcode != 0 {
            bail!(InvalidData, "non-zero mDNS Opcode({})", opcode);
        }
        if rcode != 0 {
            bail!(InvalidData, "non-zero mDNS Rcode({})", rcode);
        }

        let qd_count = self.cur.read_u16::<BE>()?;
        let an_count = self.cur.read_u16::<BE>()?;
        let ns_count = self.cur.read_u16::<BE>()?;
        let ar_count = self.cur.read_u16::<BE>()?;

        self.read_questions(qd_count)?;
        self.read_records(an_count, RecordSection::Answers)?;
        self.read_records(ns_count, RecordSection::Authorities)?;
        self.read_records(ar_count, RecordSection::Additionals)?;

        if self.cur.remaining()? > 0 {
            bail!(
                Other,
                "finished parsing with {} bytes left over",
                self.cur.remaining()?
            );
        }

        Ok(self.m)
    }

    fn read_questions(&mut self, count: u16) -> io::Result<()> {
        self.m.questions.reserve_exact(count.into());

        for _ in 0..count {
            let name = self.cur.read_name()?;
            let raw_type = self.cur.read_u16::<BE>()?;
            let raw_class = self.cur.read_u16::<BE>()?;

            let response_type = if raw_class & UNICAST_RESPONSE_BIT != 0 {
                ResponseType::Unicast
            } else {
                ResponseType::Multicast
            };

            // Drop questions of types or classes this engine does not
            // handle, rather than rejecting the whole message.
            let dns_type = match DnsType::from_u16(raw_type) {
                Some(t) => t,
                None => {
                    log::debug!("skipping question '{}' with Type({})", name, raw_type);
                    continue;
                }
            };
            let dns_class = match DnsClass::from_u16(raw_class & !UNICAST_RESPONSE_BIT) {
                Some(c) => c,
                None => {
                    log::debug!("skipping question '{}' with Class({})", name, raw_class);
                    continue;
                }
            };

            self.m
                .questions
                .push(MdnsQuestion::new(name, dns_type, dns_class, response_type));
        }

        Ok(())
    }

    fn read_records(&mut self, count: u16, section: RecordSection) -> io::Result<()> {
        for _ in 0..count {
            let name = self.cur.read_name()?;
            let raw_type = self.cur.read_u16::<BE>()?;
            let raw_class = self.cur.read_u16::<BE>()?;
            let ttl = Duration::from_secs(self.cur.read_u32::<BE>()? as u64);
            let rd_len = self.cur.read_u16::<BE>()? as usize;

            let dns_type = DnsType::from_u16(raw_type);
            let dns_class = DnsClass::from_u16(raw_class & !CACHE_FLUSH_BIT);

            let (dns_type, dns_class) = match (dns_type, dns_class) {
                (Some(t), Some(c)) if t != DnsType::ANY => (t, c),
                _ => {
                    // Unknown types (e.g. OPT) are skipped, not fatal.
                    log::debug!("skipping record '{}' with Type({})", name, raw_type);
                    if (self.cur.remaining()? as usize) < rd_len {
                        bail!(InvalidData, "record overruns message");
                    }
                    self.cur.set_position(self.cur.position() + rd_len as u64);
                    continue;
                }
            };

            let record_type = if raw_class & CACHE_FLUSH_BIT != 0 {
                RecordType::Unique
            } else {
                RecordType::Shared
            };

            let rdata = Rdata::parse(&mut self.cur, dns_type, rd_len)?;
            let record = MdnsRecord::new(name, dns_class, record_type, ttl, rdata);

            let records = match section {
                RecordSection::Answers => &mut self.m.answers,
                RecordSection::Authorities => &mut self.m.authority_records,
                RecordSection::Additionals => &mut self.m.additional_records,
            };
            records.push(record);
        }

        Ok(())
    }
}

/// Serialization buffer that performs name compression.
///
/// Compression pointers are 14 bits, so suffixes written at offsets past
/// 0x3FFF are never recorded, and a name written at an offset past 0x3FFF
/// is always re-emitted in full ([rfc1035] section 4.1.4 framing limits).
///
/// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
pub struct NameWriter {
    buf: Vec<u8>,
    offsets: HashMap<String, u16>,
    compress: bool,
}

/// The largest buffer offset a 14-bit compression pointer can refer to.
const MAX_POINTER_OFFSET: usize = 0x3FFF;

impl NameWriter {
    pub fn new() -> NameWriter {
        NameWriter {
            buf: Vec::with_capacity(512),
            offsets: HashMap::new(),
            compress: true,
        }
    }

    /// A writer that never emits or records compression pointers.
    pub fn uncompressed() -> NameWriter {
        NameWriter {
            buf: Vec::new(),
            offsets: HashMap::new(),
            compress: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn push_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn push_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn push_slice(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Reserves a 16-bit field and returns its offset for later patching.
    pub fn reserve_u16(&mut self) -> usize {
        let at = self.buf.len();
        self.push_u16(0);
        at
    }

    pub fn patch_u16(&mut self, at: usize, v: u16) {
        self.buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes `name`, compressing against previously written names where a
    /// pointer is permitted.
    pub fn write_name(&mut self, name: &DomainName) -> io::Result<()> {
        let labels = name.labels();
        let can_point = self.compress && self.buf.len() <= MAX_POINTER_OFFSET;

        for i in 0..labels.len() {
            let key = suffix_key(&labels[i..]);

            if can_point {
                if let Some(&offset) = self.offsets.get(&key) {
                    self.push_u16(0xC000 | offset);
                    return Ok(());
                }
            }

            let at = self.buf.len();
            if self.compress && at <= MAX_POINTER_OFFSET {
                self.offsets.entry(key).or_insert(at as u16);
            }

            let label = &labels[i];
            if label.len() > DomainName::MAX_LABEL_LEN {
                bail!(InvalidData, "label '{}' longer than 63 bytes", label);
            }
            self.buf.push(label.len() as u8);
            self.buf.extend_from_slice(label.as_bytes());
        }

        self.buf.push(0);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for NameWriter {
    fn default() -> Self {
        NameWriter::new()
    }
}

fn suffix_key(labels: &[String]) -> String {
    let mut key = String::new();
    for label in labels {
        key.push_str(&label.to_ascii_lowercase());
        key.push('.');
    }
    key
}
