//! Component A — Message & Type Codec (spec §4.1).
//!
//! Builds, parses, and coerces typed payloads, and packs/unpacks them over
//! the wire in an OSC-compatible framing. Grounded on the teacher's
//! `protocol::osc::Argument` / `OSCMessage` shape, generalized to the full
//! type alphabet spec.md names and given an explicit coercion matrix.

use crate::error::RuntimeError;

/// Seconds since an application-defined epoch. `0.0` means "deliver
/// immediately"; negative values are sentinels for "unknown global time".
pub type Timestamp = f64;

/// One argument value, tagged by the OSC-style single-character type code
/// it was built or parsed with.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Time(Timestamp),
    Str(String),
    Symbol(String),
    Char(char),
    Midi([u8; 4]),
    Blob(Vec<u8>),
    True,
    False,
    Bool(bool),
    Nil,
    Infinitum,
}

impl Arg {
    /// The single-character type code this argument was tagged with.
    pub fn type_code(&self) -> char {
        match self {
            Arg::Int(_) => 'i',
            Arg::Long(_) => 'h',
            Arg::Float(_) => 'f',
            Arg::Double(_) => 'd',
            Arg::Time(_) => 't',
            Arg::Str(_) => 's',
            Arg::Symbol(_) => 'S',
            Arg::Char(_) => 'c',
            Arg::Midi(_) => 'm',
            Arg::Blob(_) => 'b',
            Arg::True => 'T',
            Arg::False => 'F',
            Arg::Bool(_) => 'B',
            Arg::Nil => 'N',
            Arg::Infinitum => 'I',
        }
    }

    /// Canonical numeric view, for the numeric half of the coercion matrix.
    /// Returns `None` for non-numeric types (`s S c` aside, `c` is numeric here
    /// per spec's "Numeric types (i h f d t c B)").
    fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Int(v) => Some(*v as f64),
            Arg::Long(v) => Some(*v as f64),
            Arg::Float(v) => Some(*v as f64),
            Arg::Double(v) => Some(*v),
            Arg::Time(v) => Some(*v),
            Arg::Char(v) => Some(*v as u32 as f64),
            Arg::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Arg::True => Some(1.0),
            Arg::False => Some(0.0),
            _ => None,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Arg::Int(_)
                | Arg::Long(_)
                | Arg::Float(_)
                | Arg::Double(_)
                | Arg::Time(_)
                | Arg::Char(_)
                | Arg::Bool(_)
                | Arg::True
                | Arg::False
        )
    }

    /// Applies the coercion matrix of spec §4.1: converts this argument to
    /// the requested type code, or returns `None` if the pair is not in the
    /// coercion image (the caller should then treat the handler as skipped).
    pub fn coerce_to(&self, want: char) -> Option<Arg> {
        if self.type_code() == want {
            return Some(self.clone());
        }
        match (self, want) {
            // N and I never coerce to a value; only to themselves (handled above).
            (Arg::Nil, _) | (Arg::Infinitum, _) => None,
            (_, 'N') | (_, 'I') => None,
            // T/F <-> B
            (Arg::True, 'B') => Some(Arg::Bool(true)),
            (Arg::False, 'B') => Some(Arg::Bool(false)),
            (Arg::Bool(true), 'T') => Some(Arg::True),
            (Arg::Bool(false), 'F') => Some(Arg::False),
            // s <-> S
            (Arg::Str(s), 'S') => Some(Arg::Symbol(s.clone())),
            (Arg::Symbol(s), 's') => Some(Arg::Str(s.clone())),
            // numeric family wraps/saturates freely
            (a, code) if a.is_numeric() && "ihfdtcB".contains(code) => {
                let v = a.as_f64().unwrap();
                Some(match code {
                    'i' => Arg::Int(v as i64 as i32),
                    'h' => Arg::Long(v as i64),
                    'f' => Arg::Float(v as f32),
                    'd' => Arg::Double(v),
                    't' => Arg::Time(v),
                    'c' => Arg::Char(char::from_u32((v as i64 as u32) & 0x10FFFF).unwrap_or('\0')),
                    'B' => Arg::Bool(v != 0.0),
                    _ => unreachable!(),
                })
            }
            _ => None,
        }
    }
}

/// An immutable, sealed message: a timestamp, an address path, and typed args.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub timestamp: Timestamp,
    pub address: String,
    pub args: Vec<Arg>,
}

impl Message {
    /// The type descriptor string, one character per argument, in order.
    pub fn type_tags(&self) -> String {
        self.args.iter().map(|a| a.type_code()).collect()
    }

    /// `true` if the address begins with `!` — spec.md: "asserts 'no pattern
    /// characters'" — the trie must match it literally, segment by segment.
    pub fn is_literal_address(&self) -> bool {
        self.address.starts_with('!')
    }

    /// The address with any leading pattern-exemption marker stripped.
    pub fn path(&self) -> &str {
        self.address.trim_start_matches(['/', '!'])
    }

    pub fn start_extract(&self) -> Extractor<'_> {
        Extractor { message: self, pos: 0 }
    }

    /// Encodes the message to the wire form described in spec §4.1:
    /// 4-byte aligned address, `,` + type tags, packed args, big-endian
    /// integers/floats, size-prefixed padded blobs, 64-bit double timestamps.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_padded_string(&mut out, &self.address);
        let mut tags = String::from(",");
        tags.push_str(&self.type_tags());
        write_padded_string(&mut out, &tags);
        for arg in &self.args {
            encode_arg(&mut out, arg);
        }
        out
    }

    /// Decodes a message from the wire form produced by [`Message::encode`].
    /// Malformed input (misaligned padding, a type descriptor not starting
    /// with `,`, or a declared length inconsistent with the parsed types) is
    /// a [`RuntimeError::Protocol`], per spec §4.1.
    pub fn decode(buf: &[u8], timestamp: Timestamp) -> Result<Message, RuntimeError> {
        let mut cursor = 0usize;
        let address = read_padded_string(buf, &mut cursor)?;
        let tags_raw = read_padded_string(buf, &mut cursor)?;
        let tags = tags_raw
            .strip_prefix(',')
            .ok_or_else(|| RuntimeError::Protocol("type descriptor missing leading ','".into()))?;
        let mut args = Vec::with_capacity(tags.len());
        for code in tags.chars() {
            args.push(decode_arg(buf, &mut cursor, code)?);
        }
        Ok(Message { timestamp, address, args })
    }
}

fn pad4(len: usize) -> usize {
    (len + 4) & !3
}

fn write_padded_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    let padded = pad4(s.len());
    out.resize(out.len() + (padded - s.len()), 0);
}

fn read_padded_string(buf: &[u8], cursor: &mut usize) -> Result<String, RuntimeError> {
    let start = *cursor;
    let nul = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| RuntimeError::Protocol("unterminated string".into()))?;
    let s = std::str::from_utf8(&buf[start..start + nul])
        .map_err(|e| RuntimeError::Protocol(format!("invalid utf8: {e}")))?
        .to_string();
    let padded = pad4(nul);
    if start + padded > buf.len() {
        return Err(RuntimeError::Protocol("non-aligned padding".into()));
    }
    *cursor = start + padded;
    Ok(s)
}

fn encode_arg(out: &mut Vec<u8>, arg: &Arg) {
    match arg {
        Arg::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
        Arg::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
        Arg::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
        Arg::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
        Arg::Time(v) => out.extend_from_slice(&v.to_be_bytes()),
        Arg::Str(s) => write_padded_string(out, s),
        Arg::Symbol(s) => write_padded_string(out, s),
        Arg::Char(c) => out.extend_from_slice(&(*c as u32).to_be_bytes()),
        Arg::Midi(bytes) => out.extend_from_slice(bytes),
        Arg::Blob(data) => {
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(data);
            let padded = pad4(data.len());
            out.resize(out.len() + (padded - data.len()), 0);
        }
        Arg::True | Arg::False | Arg::Nil | Arg::Infinitum => {}
        Arg::Bool(b) => out.push(if *b { 1 } else { 0 }),
    }
}

fn decode_arg(buf: &[u8], cursor: &mut usize, code: char) -> Result<Arg, RuntimeError> {
    fn take<'a>(buf: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8], RuntimeError> {
        if *cursor + n > buf.len() {
            return Err(RuntimeError::Protocol("declared length inconsistent".into()));
        }
        let slice = &buf[*cursor..*cursor + n];
        *cursor += n;
        Ok(slice)
    }

    Ok(match code {
        'i' => Arg::Int(i32::from_be_bytes(take(buf, cursor, 4)?.try_into().unwrap())),
        'h' => Arg::Long(i64::from_be_bytes(take(buf, cursor, 8)?.try_into().unwrap())),
        'f' => Arg::Float(f32::from_be_bytes(take(buf, cursor, 4)?.try_into().unwrap())),
        'd' => Arg::Double(f64::from_be_bytes(take(buf, cursor, 8)?.try_into().unwrap())),
        't' => Arg::Time(f64::from_be_bytes(take(buf, cursor, 8)?.try_into().unwrap())),
        's' => Arg::Str(read_padded_string(buf, cursor)?),
        'S' => Arg::Symbol(read_padded_string(buf, cursor)?),
        'c' => {
            let raw = u32::from_be_bytes(take(buf, cursor, 4)?.try_into().unwrap());
            Arg::Char(char::from_u32(raw).unwrap_or('\0'))
        }
        'm' => Arg::Midi(take(buf, cursor, 4)?.try_into().unwrap()),
        'b' => {
            let len = u32::from_be_bytes(take(buf, cursor, 4)?.try_into().unwrap()) as usize;
            let data = take(buf, cursor, len)?.to_vec();
            let padded = pad4(len);
            if padded > len {
                let _ = take(buf, cursor, padded - len)?;
            }
            Arg::Blob(data)
        }
        'T' => Arg::True,
        'F' => Arg::False,
        'B' => Arg::Bool(take(buf, cursor, 1)?[0] != 0),
        'N' => Arg::Nil,
        'I' => Arg::Infinitum,
        other => return Err(RuntimeError::Protocol(format!("unknown type code '{other}'"))),
    })
}

/// Incremental, per-argument parser with optional type coercion, as spec §4.1
/// / §6 (`start_extract` / `get_next`) describe.
pub struct Extractor<'m> {
    message: &'m Message,
    pos: usize,
}

impl<'m> Extractor<'m> {
    /// Returns the next argument coerced to `want`, or `None` if the
    /// descriptor doesn't match and no coercion bridges the gap, or the
    /// message is exhausted.
    pub fn get_next(&mut self, want: char) -> Option<Arg> {
        let arg = self.message.args.get(self.pos)?;
        self.pos += 1;
        arg.coerce_to(want)
    }
}

/// Builder for incremental construction of a [`Message`], replacing the
/// original's marker-argument sentinel convention (spec §9) with a builder
/// whose argument list is structurally matched to the type descriptor by
/// construction: each `add_*` call appends one argument.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    args: Vec<Arg>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        MessageBuilder::default()
    }

    pub fn add_int(mut self, v: i32) -> Self {
        self.args.push(Arg::Int(v));
        self
    }
    pub fn add_long(mut self, v: i64) -> Self {
        self.args.push(Arg::Long(v));
        self
    }
    pub fn add_float(mut self, v: f32) -> Self {
        self.args.push(Arg::Float(v));
        self
    }
    pub fn add_double(mut self, v: f64) -> Self {
        self.args.push(Arg::Double(v));
        self
    }
    pub fn add_time(mut self, v: Timestamp) -> Self {
        self.args.push(Arg::Time(v));
        self
    }
    pub fn add_string(mut self, v: impl Into<String>) -> Self {
        self.args.push(Arg::Str(v.into()));
        self
    }
    pub fn add_symbol(mut self, v: impl Into<String>) -> Self {
        self.args.push(Arg::Symbol(v.into()));
        self
    }
    pub fn add_char(mut self, v: char) -> Self {
        self.args.push(Arg::Char(v));
        self
    }
    pub fn add_midi(mut self, v: [u8; 4]) -> Self {
        self.args.push(Arg::Midi(v));
        self
    }
    pub fn add_blob(mut self, v: Vec<u8>) -> Self {
        self.args.push(Arg::Blob(v));
        self
    }
    pub fn add_bool(mut self, v: bool) -> Self {
        self.args.push(if v { Arg::True } else { Arg::False });
        self
    }
    pub fn add_nil(mut self) -> Self {
        self.args.push(Arg::Nil);
        self
    }
    pub fn add_infinitum(mut self) -> Self {
        self.args.push(Arg::Infinitum);
        self
    }

    /// Appends an already-tagged argument directly; used by gateways that
    /// decode a foreign wire format into [`Arg`] values first.
    pub fn add_arg(mut self, v: Arg) -> Self {
        self.args.push(v);
        self
    }

    /// Seals the builder into an immutable [`Message`]. The address must
    /// start with `/` or `!` (spec §3 Data Model).
    pub fn seal(self, time: Timestamp, address: impl Into<String>) -> Result<Message, RuntimeError> {
        let address = address.into();
        if !(address.starts_with('/') || address.starts_with('!')) {
            return Err(RuntimeError::Protocol(format!(
                "address '{address}' must start with '/' or '!'"
            )));
        }
        Ok(Message { timestamp: time, address, args: self.args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_type() {
        let msg = MessageBuilder::new()
            .add_int(7)
            .add_long(-9)
            .add_float(1.5)
            .add_double(2.25)
            .add_time(123.0)
            .add_string("hi")
            .add_symbol("sym")
            .add_char('x')
            .add_midi([0x90, 60, 100, 0])
            .add_blob(vec![1, 2, 3])
            .add_bool(true)
            .add_bool(false)
            .add_nil()
            .add_infinitum()
            .seal(0.0, "/a/b")
            .unwrap();

        let wire = msg.encode();
        let decoded = Message::decode(&wire, 0.0).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.type_tags(), "ihfdtsScmbTFNI");
    }

    #[test]
    fn coercion_truncates_and_widens() {
        let msg = MessageBuilder::new().add_float(3.5).add_int(2).seal(0.0, "/x").unwrap();
        let mut ex = msg.start_extract();
        assert_eq!(ex.get_next('i'), Some(Arg::Int(3)));
        assert_eq!(ex.get_next('d'), Some(Arg::Double(2.0)));
    }

    #[test]
    fn nil_and_infinitum_never_coerce() {
        assert_eq!(Arg::Nil.coerce_to('i'), None);
        assert_eq!(Arg::Infinitum.coerce_to('f'), None);
        assert_eq!(Arg::Int(1).coerce_to('N'), None);
    }

    #[test]
    fn string_symbol_pair_coerces() {
        assert_eq!(Arg::Str("a".into()).coerce_to('S'), Some(Arg::Symbol("a".into())));
        assert_eq!(Arg::Symbol("a".into()).coerce_to('s'), Some(Arg::Str("a".into())));
        assert_eq!(Arg::Str("a".into()).coerce_to('i'), None);
    }

    #[test]
    fn builder_rejects_bad_address() {
        let err = MessageBuilder::new().seal(0.0, "bad").unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }

    #[test]
    fn literal_address_marker_is_detected() {
        let msg = MessageBuilder::new().seal(0.0, "!syn/a/x").unwrap();
        assert!(msg.is_literal_address());
        assert_eq!(msg.path(), "syn/a/x");
    }

    #[test]
    fn decode_rejects_missing_comma() {
        let mut out = Vec::new();
        write_padded_string(&mut out, "/a");
        write_padded_string(&mut out, "i");
        let err = Message::decode(&out, 0.0).unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }
}
