use std::path::Path;

use crate::command::server::error::Error;

const VERSION_1: u16 = 0x0501;
const VERSION_2: u16 = 0x0502;

/// Long-term key of one service principal.
#[derive(Clone, PartialEq, Eq)]
pub struct KeytabEntry {
    pub realm: String,
    pub components: Vec<String>,
    pub name_type: u32,
    pub timestamp: u32,
    pub kvno: u32,
    pub enctype: i32,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for KeytabEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeytabEntry")
            .field("principal", &self.principal())
            .field("kvno", &self.kvno)
            .field("enctype", &self.enctype)
            .finish_non_exhaustive()
    }
}

impl KeytabEntry {
    /// `primary/instance@REALM`
    pub fn principal(&self) -> String {
        format!("{}@{}", self.components.join("/"), self.realm)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Keytab {
    pub entries: Vec<KeytabEntry>,
}

impl Keytab {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path).map_err(|e| {
            Error::Initialization(format!("unable to read keytab file {}: {e}", path.display()))
        })?;

        Self::parse(&data)
            .map_err(|e| Error::Initialization(format!("unable to parse keytab file: {e}")))
    }

    /// Parses the MIT keytab format. Both versions are read big-endian.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let mut reader = Reader::new(data);

        let version = reader.u16()?;
        if version != VERSION_1 && version != VERSION_2 {
            return Err(format!("unsupported keytab version {version:#06x}"));
        }

        let mut entries = Vec::new();
        while !reader.is_empty() {
            let size = reader.i32()?;
            if size < 0 {
                // deleted entry
                reader.skip(size.unsigned_abs() as usize)?;
                continue;
            }
            if size == 0 {
                break;
            }

            let record = reader.take(size as usize)?;
            entries.push(parse_entry(record, version)?);
        }

        Ok(Self { entries })
    }

    /// Key matching the ticket's server principal, encryption type and key
    /// version; the newest version is used when the ticket names none.
    pub fn find(
        &self,
        components: &[String],
        realm: &str,
        enctype: i32,
        kvno: Option<u32>,
    ) -> Option<&KeytabEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.components == components
                    && entry.realm.eq_ignore_ascii_case(realm)
                    && entry.enctype == enctype
                    && kvno.map_or(true, |kvno| entry.kvno == kvno)
            })
            .max_by_key(|entry| entry.kvno)
    }
}

fn parse_entry(record: &[u8], version: u16) -> Result<KeytabEntry, String> {
    let mut reader = Reader::new(record);

    let mut count = reader.u16()?;
    if version == VERSION_1 {
        // version 1 counts the realm as a component
        count = count.saturating_sub(1);
    }

    let realm = reader.string()?;
    let components = (0..count)
        .map(|_| reader.string())
        .collect::<Result<Vec<_>, _>>()?;
    let name_type = if version == VERSION_2 { reader.u32()? } else { 1 };
    let timestamp = reader.u32()?;
    let kvno8 = reader.u8()?;
    let enctype = reader.u16()?;
    let key = reader.octets()?.to_vec();

    // Optional 32-bit key version, present when the 8-bit one overflowed.
    let kvno = match reader.remaining() {
        n if n >= 4 => match reader.u32()? {
            0 => u32::from(kvno8),
            kvno => kvno,
        },
        _ => u32::from(kvno8),
    };

    Ok(KeytabEntry {
        realm,
        components,
        name_type,
        timestamp,
        kvno,
        enctype: i32::from(enctype),
        key,
    })
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        if self.data.len() < len {
            return Err(format!(
                "truncated keytab: wanted {len} bytes, {} left",
                self.data.len()
            ));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, len: usize) -> Result<(), String> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, String> {
        self.u32().map(|value| value as i32)
    }

    fn octets(&mut self) -> Result<&'a [u8], String> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }

    fn string(&mut self) -> Result<String, String> {
        let bytes = self.octets()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid principal name: {e}"))
    }
}
