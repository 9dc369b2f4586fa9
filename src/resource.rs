//! Resource record data (RDATA) definitions.

use crate::bail;
use crate::io::DnsReadExt;
use crate::message::NameWriter;
use crate::name::DomainName;
use crate::types::DnsType;
use byteorder::{ReadBytesExt, BE};
use std::fmt;
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Server selection record data, [rfc2782].
///
/// [rfc2782]: https://datatracker.ietf.org/doc/html/rfc2782
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Srv {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: DomainName,
}

impl fmt::Display for Srv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.priority, self.weight, self.port, self.target
        )
    }
}

/// Next-secure record data, restricted to the mDNS use described in
/// [rfc6762] section 6.1: the owner name plus a type bit map.
///
/// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Nsec {
    pub next_domain: DomainName,
    /// The types asserted by the bit map, ascending.
    pub types: Vec<DnsType>,
}

/// Record data, tagged by [`DnsType`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Rdata {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    PTR(DomainName),
    SRV(Srv),

    /// A TXT record is a sequence of length-prefixed strings. The strings
    /// are not required to be UTF-8. An empty record is encoded as a single
    /// zero-length string.
    TXT(Vec<Vec<u8>>),

    NSEC(Nsec),
}

impl Rdata {
    // This should be kept in sync with DnsType.
    pub fn dns_type(&self) -> DnsType {
        match self {
            Rdata::A(_) => DnsType::A,
            Rdata::AAAA(_) => DnsType::AAAA,
            Rdata::PTR(_) => DnsType::PTR,
            Rdata::SRV(_) => DnsType::SRV,
            Rdata::TXT(_) => DnsType::TXT,
            Rdata::NSEC(_) => DnsType::NSEC,
        }
    }

    /// Parses RDATA of the given type from `cur`, which must be positioned
    /// at the start of the RDATA and have at least `len` bytes remaining.
    /// Names inside the RDATA may use compression pointers into the message.
    pub fn parse(cur: &mut Cursor<&[u8]>, r#type: DnsType, len: usize) -> io::Result<Rdata> {
        let start = cur.position();

        let rdata = match r#type {
            DnsType::A => {
                if len != 4 {
                    bail!(InvalidData, "invalid A record length ({}) expected 4", len);
                }
                Rdata::A(Ipv4Addr::from(cur.read_u32::<BE>()?))
            }

            DnsType::AAAA => {
                if len != 16 {
                    bail!(
                        InvalidData,
                        "invalid AAAA record length ({}) expected 16",
                        len
                    );
                }
                Rdata::AAAA(Ipv6Addr::from(cur.read_u128::<BE>()?))
            }

            DnsType::PTR => Rdata::PTR(cur.read_name()?),

            DnsType::SRV => {
                let priority = cur.read_u16::<BE>()?;
                let weight = cur.read_u16::<BE>()?;
                let port = cur.read_u16::<BE>()?;
                let target = cur.read_name()?;
                Rdata::SRV(Srv {
                    priority,
                    weight,
                    port,
                    target,
                })
            }

            DnsType::TXT => Rdata::TXT(parse_txt(cur, len)?),

            DnsType::NSEC => {
                let next_domain = cur.read_name()?;
                let consumed = (cur.position() - start) as usize;
                if consumed > len {
                    bail!(InvalidData, "NSEC record too short");
                }
                let types = parse_type_bitmaps(cur, len - consumed)?;
                Rdata::NSEC(Nsec { next_domain, types })
            }

            DnsType::ANY => bail!(InvalidData, "ANY is not a valid record type"),
        };

        let consumed = (cur.position() - start) as usize;
        if consumed != len {
            bail!(
                InvalidData,
                "rdata length ({}) did not match declared record len ({})",
                consumed,
                len
            );
        }

        Ok(rdata)
    }

    /// Writes the RDATA, preceded by its 16-bit length.
    pub fn write(&self, w: &mut NameWriter) -> io::Result<()> {
        // Reserve the length field and patch it afterwards; PTR and SRV
        // names may compress against earlier parts of the message.
        let len_at = w.reserve_u16();
        let start = w.len();

        match self {
            Rdata::A(ip) => w.push_slice(&ip.octets()),
            Rdata::AAAA(ip) => w.push_slice(&ip.octets()),
            Rdata::PTR(name) => w.write_name(name)?,
            Rdata::SRV(srv) => {
                w.push_u16(srv.priority);
                w.push_u16(srv.weight);
                w.push_u16(srv.port);
                w.write_name(&srv.target)?;
            }
            Rdata::TXT(entries) => write_txt(w, entries),
            Rdata::NSEC(nsec) => {
                w.write_name(&nsec.next_domain)?;
                write_type_bitmaps(w, &nsec.types);
            }
        }

        let len = w.len() - start;
        if len > u16::MAX as usize {
            bail!(InvalidData, "rdata too large ({} bytes)", len);
        }
        w.patch_u16(len_at, len as u16);

        Ok(())
    }

    /// The RDATA bytes with no compression applied. An upper bound for the
    /// on-the-wire size, and the byte sequence used for lexicographic
    /// record comparison during probe tiebreaking ([rfc6762] section
    /// 8.2.1).
    ///
    /// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
    pub fn to_uncompressed_bytes(&self) -> Vec<u8> {
        let mut w = NameWriter::uncompressed();
        self.write(&mut w).expect("rdata serialization");
        // Strip the length prefix.
        w.into_bytes()[2..].to_vec()
    }

    /// Upper bound for the serialized size of this RDATA including the
    /// length field.
    pub fn max_wire_size(&self) -> usize {
        2 + match self {
            Rdata::A(_) => 4,
            Rdata::AAAA(_) => 16,
            Rdata::PTR(name) => name.wire_size(),
            Rdata::SRV(srv) => 6 + srv.target.wire_size(),
            Rdata::TXT(entries) => {
                if entries.is_empty() {
                    1
                } else {
                    entries.iter().map(|e| e.len() + 1).sum()
                }
            }
            Rdata::NSEC(nsec) => nsec.next_domain.wire_size() + 2 + 32,
        }
    }
}

impl fmt::Display for Rdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rdata::A(ip) => ip.fmt(f),
            Rdata::AAAA(ip) => ip.fmt(f),
            Rdata::PTR(name) => name.fmt(f),
            Rdata::SRV(srv) => srv.fmt(f),
            Rdata::TXT(entries) => {
                let strings: Vec<String> = entries
                    .iter()
                    .map(|e| String::from_utf8_lossy(e).into_owned())
                    .collect();
                write!(f, "\"{}\"", strings.join(" "))
            }
            Rdata::NSEC(nsec) => {
                write!(f, "{}", nsec.next_domain)?;
                for t in &nsec.types {
                    write!(f, " {}", t)?;
                }
                Ok(())
            }
        }
    }
}

fn parse_txt(cur: &mut Cursor<&[u8]>, len: usize) -> io::Result<Vec<Vec<u8>>> {
    let mut entries = Vec::new();
    let mut consumed = 0;

    while consumed < len {
        let entry_len = cur.read_u8()? as usize;
        consumed += 1 + entry_len;
        if consumed > len {
            bail!(InvalidData, "TXT record too short");
        }

        let mut entry = vec![0; entry_len];
        cur.read_exact(&mut entry)?;
        entries.push(entry);
    }

    // An empty TXT record is a single zero-length string.
    if entries.len() == 1 && entries[0].is_empty() {
        entries.clear();
    }

    Ok(entries)
}

fn write_txt(w: &mut NameWriter, entries: &[Vec<u8>]) {
    if entries.is_empty() {
        w.push_u8(0);
        return;
    }
    for entry in entries {
        debug_assert!(entry.len() <= u8::MAX as usize);
        w.push_u8(entry.len() as u8);
        w.push_slice(entry);
    }
}

// NSEC type bit maps, [rfc4034] section 4.1.2. Only window block 0 is
// needed: every type this engine handles has a value below 256.
fn parse_type_bitmaps(cur: &mut Cursor<&[u8]>, len: usize) -> io::Result<Vec<DnsType>> {
    use num_traits::FromPrimitive;

    let mut types = Vec::new();
    let mut consumed = 0;

    while consumed < len {
        let window = cur.read_u8()?;
        let bitmap_len = cur.read_u8()? as usize;
        consumed += 2 + bitmap_len;
        if consumed > len || bitmap_len > 32 {
            bail!(InvalidData, "invalid NSEC bit map");
        }

        let mut bitmap = vec![0; bitmap_len];
        cur.read_exact(&mut bitmap)?;

        if window != 0 {
            continue; // Types above 255 are not relevant here.
        }

        for (byte_index, byte) in bitmap.iter().enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    let value = (byte_index * 8 + bit) as u16;
                    if let Some(t) = DnsType::from_u16(value) {
                        types.push(t);
                    }
                }
            }
        }
    }

    Ok(types)
}

fn write_type_bitmaps(w: &mut NameWriter, types: &[DnsType]) {
    let mut bitmap = [0u8; 32];
    let mut max_byte = 0;
    for t in types {
        let value = *t as u16 as usize;
        debug_assert!(value < 256);
        bitmap[value / 8] |= 0x80 >> (value % 8);
        max_byte = max_byte.max(value / 8);
    }

    w.push_u8(0); // window block 0
    w.push_u8((max_byte + 1) as u8);
    w.push_slice(&bitmap[..=max_byte]);
}
