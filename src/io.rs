//! Cursor extension traits to help parsing of DNS wire format.

use crate::bail;
use crate::name::DomainName;
use byteorder::ReadBytesExt;
use std::io;
use std::io::Cursor;
use std::io::SeekFrom;

pub trait SeekExt: io::Seek {
    /// Returns the number of bytes remaining to be consumed.
    /// This is used as a way to check for malformed input.
    fn remaining(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;

        // reset position
        self.seek(SeekFrom::Start(pos))?;

        Ok(len - pos)
    }
}

impl<'a> SeekExt for Cursor<&'a [u8]> {
    fn remaining(self: &mut std::io::Cursor<&'a [u8]>) -> io::Result<u64> {
        let pos = self.position() as usize;
        let len = self.get_ref().len();

        Ok((len - pos) as u64)
    }
}

/// All types that implement `Read` and `Seek` get methods defined
/// in `DnsReadExt` for free.
impl<R: io::Read + ?Sized + io::Seek> DnsReadExt for R {}

/// Extensions to io::Read for DNS wire-format names.
pub trait DnsReadExt: io::Read + io::Seek {
    /// Reads a domain name from the current position, following compression
    /// pointers.
    ///
    /// # Errors
    ///
    /// Returns io::Error(InvalidData) if a label is malformed, a pointer
    /// refers to bytes at or after the start of this name (which could
    /// loop), or an unsupported label type is encountered.
    fn read_name(&mut self) -> io::Result<DomainName> {
        let mut labels = Vec::new();
        let start = self.stream_position()?;

        // Read each label one at a time, to build up the full domain name.
        loop {
            let len = self.read_u8()?;
            if len == 0 {
                break;
            }

            match len & 0xC0 {
                // No compression
                0x00 => {
                    let mut label = vec![0; len.into()];
                    self.read_exact(&mut label)?;

                    let label = match String::from_utf8(label) {
                        Err(e) => bail!(InvalidData, "invalid label: {}", e),
                        Ok(s) => s,
                    };

                    if !label.is_ascii() {
                        bail!(InvalidData, "invalid label '{}': not valid ascii", label);
                    }

                    labels.push(label);
                }

                // Compression
                0xC0 => {
                    // Read the 14 bit pointer.
                    let b2 = self.read_u8()? as u16;
                    let ptr = ((len as u16 & !0xC0) << 8 | b2) as u64;

                    // Make sure we don't get into a loop.
                    if ptr >= start {
                        bail!(
                            InvalidData,
                            "invalid compressed pointer pointing to future bytes"
                        );
                    }

                    // We are going to jump backwards, so record where we
                    // currently are, and reset it after.
                    let current = self.stream_position()?;

                    self.seek(SeekFrom::Start(ptr))?;
                    let rest = self.read_name()?;
                    labels.extend(rest.labels().iter().cloned());

                    self.seek(SeekFrom::Start(current))?;

                    break;
                }

                // Unknown
                _ => bail!(InvalidData, "unsupported label type {0:b}", len & 0xC0),
            }
        }

        match DomainName::new(labels) {
            Ok(name) => Ok(name),
            Err(e) => bail!(InvalidData, "invalid domain name: {}", e),
        }
    }
}
