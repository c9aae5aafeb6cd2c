// ── Minimal CBOR codec ──
//
// Just enough of RFC 8949 for SMP bodies: all eight major types, indefinite
// length strings/arrays/maps on decode, and half/single/double floats.
// Maps keep insertion order so encoded frames are byte-for-byte stable.

use crate::error::Error;

const MAX_DEPTH: usize = 32;
const BREAK: u8 = 0xFF;

/// A decoded CBOR data item.
#[derive(Debug, Clone, PartialEq)]
pub enum CborValue {
    Unsigned(u64),
    /// Negative integer stored as CBOR does: the value is `-1 - n`.
    Negative(u64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<CborValue>),
    Map(Vec<(CborValue, CborValue)>),
    Tag(u64, Box<CborValue>),
    Bool(bool),
    Null,
    Undefined,
    Simple(u8),
    Float(f64),
}

impl CborValue {
    /// Build a map with text keys.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, CborValue)>) -> Self {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Self::Text(k.into()), v))
                .collect(),
        )
    }

    pub fn integer(value: i64) -> Self {
        if value >= 0 {
            Self::Unsigned(value.unsigned_abs())
        } else {
            Self::Negative(value.unsigned_abs() - 1)
        }
    }

    /// Look up a text key in a map.
    pub fn get(&self, key: &str) -> Option<&CborValue> {
        match self {
            Self::Map(entries) => entries.iter().find_map(|(k, v)| match k {
                Self::Text(t) if t == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Unsigned(n) => i64::try_from(*n).ok(),
            Self::Negative(n) => i64::try_from(*n).ok().map(|n| -1 - n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CborValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }
}

// ── Encoding ────────────────────────────────────────────────────────

fn write_head(out: &mut Vec<u8>, major: u8, value: u64) {
    let major = major << 5;
    if let Ok(small) = u8::try_from(value) {
        if small < 24 {
            out.push(major | small);
        } else {
            out.push(major | 24);
            out.push(small);
        }
    } else if let Ok(v) = u16::try_from(value) {
        out.push(major | 25);
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = u32::try_from(value) {
        out.push(major | 26);
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        out.push(major | 27);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Size of the head that introduces an item with argument `value`.
pub fn head_len(value: u64) -> usize {
    match value {
        0..=23 => 1,
        24..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

fn len_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

fn encode_into(out: &mut Vec<u8>, value: &CborValue) {
    match value {
        CborValue::Unsigned(n) => write_head(out, 0, *n),
        CborValue::Negative(n) => write_head(out, 1, *n),
        CborValue::Bytes(b) => {
            write_head(out, 2, len_u64(b.len()));
            out.extend_from_slice(b);
        }
        CborValue::Text(s) => {
            write_head(out, 3, len_u64(s.len()));
            out.extend_from_slice(s.as_bytes());
        }
        CborValue::Array(items) => {
            write_head(out, 4, len_u64(items.len()));
            for item in items {
                encode_into(out, item);
            }
        }
        CborValue::Map(entries) => {
            write_head(out, 5, len_u64(entries.len()));
            for (k, v) in entries {
                encode_into(out, k);
                encode_into(out, v);
            }
        }
        CborValue::Tag(tag, inner) => {
            write_head(out, 6, *tag);
            encode_into(out, inner);
        }
        CborValue::Bool(false) => out.push(0xF4),
        CborValue::Bool(true) => out.push(0xF5),
        CborValue::Null => out.push(0xF6),
        CborValue::Undefined => out.push(0xF7),
        CborValue::Simple(n) => write_head(out, 7, u64::from(*n)),
        CborValue::Float(f) => {
            out.push(0xFB);
            out.extend_from_slice(&f.to_be_bytes());
        }
    }
}

pub fn encode(value: &CborValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(&mut out, value);
    out
}

// ── Decoding ────────────────────────────────────────────────────────

struct Decoder<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    fn error(&self, reason: impl Into<String>) -> Error {
        Error::Cbor {
            offset: self.offset,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Result<u8, Error> {
        self.data
            .get(self.offset)
            .copied()
            .ok_or_else(|| self.error("unexpected end of input"))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.error(format!("need {len} more bytes")))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        let b = self.peek()?;
        self.offset += 1;
        Ok(b)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let raw = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    /// Argument of a head; `None` means indefinite length (additional info 31).
    fn argument(&mut self, info: u8) -> Result<Option<u64>, Error> {
        match info {
            0..=23 => Ok(Some(u64::from(info))),
            24 => Ok(Some(u64::from(self.u8()?))),
            25 => Ok(Some(u64::from(u16::from_be_bytes(self.array()?)))),
            26 => Ok(Some(u64::from(u32::from_be_bytes(self.array()?)))),
            27 => Ok(Some(u64::from_be_bytes(self.array()?))),
            31 => Ok(None),
            _ => Err(self.error(format!("reserved additional info {info}"))),
        }
    }

    fn length(&self, value: u64) -> Result<usize, Error> {
        usize::try_from(value).map_err(|_| self.error("length overflows usize"))
    }

    fn definite(&mut self, info: u8) -> Result<u64, Error> {
        self.argument(info)?
            .ok_or_else(|| self.error("indefinite length not allowed here"))
    }

    fn chunks(&mut self, major: u8) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        loop {
            if self.peek()? == BREAK {
                self.offset += 1;
                return Ok(out);
            }
            let head = self.u8()?;
            if head >> 5 != major {
                return Err(self.error("mismatched chunk type in indefinite string"));
            }
            let len = self.definite(head & 0x1F)?;
            let len = self.length(len)?;
            out.extend_from_slice(self.take(len)?);
        }
    }

    fn text(&self, raw: Vec<u8>) -> Result<String, Error> {
        String::from_utf8(raw).map_err(|_| self.error("invalid UTF-8 in text string"))
    }

    fn item(&mut self, depth: usize) -> Result<CborValue, Error> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        let head = self.u8()?;
        let major = head >> 5;
        let info = head & 0x1F;

        match major {
            0 => Ok(CborValue::Unsigned(self.definite(info)?)),
            1 => Ok(CborValue::Negative(self.definite(info)?)),
            2 | 3 => {
                let raw = match self.argument(info)? {
                    Some(len) => {
                        let len = self.length(len)?;
                        self.take(len)?.to_vec()
                    }
                    None => self.chunks(major)?,
                };
                if major == 2 {
                    Ok(CborValue::Bytes(raw))
                } else {
                    Ok(CborValue::Text(self.text(raw)?))
                }
            }
            4 => {
                let mut items = Vec::new();
                match self.argument(info)? {
                    Some(len) => {
                        for _ in 0..len {
                            items.push(self.item(depth + 1)?);
                        }
                    }
                    None => {
                        while self.peek()? != BREAK {
                            items.push(self.item(depth + 1)?);
                        }
                        self.offset += 1;
                    }
                }
                Ok(CborValue::Array(items))
            }
            5 => {
                let mut entries = Vec::new();
                match self.argument(info)? {
                    Some(len) => {
                        for _ in 0..len {
                            let k = self.item(depth + 1)?;
                            let v = self.item(depth + 1)?;
                            entries.push((k, v));
                        }
                    }
                    None => {
                        while self.peek()? != BREAK {
                            let k = self.item(depth + 1)?;
                            let v = self.item(depth + 1)?;
                            entries.push((k, v));
                        }
                        self.offset += 1;
                    }
                }
                Ok(CborValue::Map(entries))
            }
            6 => {
                let tag = self.definite(info)?;
                Ok(CborValue::Tag(tag, Box::new(self.item(depth + 1)?)))
            }
            _ => self.simple(info),
        }
    }

    fn simple(&mut self, info: u8) -> Result<CborValue, Error> {
        match info {
            20 => Ok(CborValue::Bool(false)),
            21 => Ok(CborValue::Bool(true)),
            22 => Ok(CborValue::Null),
            23 => Ok(CborValue::Undefined),
            24 => Ok(CborValue::Simple(self.u8()?)),
            25 => Ok(CborValue::Float(half_to_f64(u16::from_be_bytes(self.array()?)))),
            26 => Ok(CborValue::Float(f64::from(f32::from_be_bytes(self.array()?)))),
            27 => Ok(CborValue::Float(f64::from_be_bytes(self.array()?))),
            0..=19 => Ok(CborValue::Simple(info)),
            _ => Err(self.error(format!("unexpected simple value {info}"))),
        }
    }
}

/// IEEE 754 binary16 to f64.
fn half_to_f64(half: u16) -> f64 {
    let exponent = i32::from((half >> 10) & 0x1F);
    let mantissa = f64::from(half & 0x3FF);
    let magnitude = match exponent {
        0 => mantissa * 2f64.powi(-24),
        31 => {
            if half & 0x3FF == 0 {
                f64::INFINITY
            } else {
                f64::NAN
            }
        }
        _ => (mantissa + 1024.0) * 2f64.powi(exponent - 25),
    };
    if half & 0x8000 == 0 { magnitude } else { -magnitude }
}

/// Decode exactly one data item spanning all of `data`.
///
/// An empty body decodes as an empty map, which is how SMP devices answer
/// commands that carry no result.
pub fn decode(data: &[u8]) -> Result<CborValue, Error> {
    if data.is_empty() {
        return Ok(CborValue::Map(Vec::new()));
    }
    let mut decoder = Decoder { data, offset: 0 };
    let value = decoder.item(0)?;
    if decoder.offset != data.len() {
        return Err(decoder.error("trailing bytes after data item"));
    }
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hex(s: &str) -> Vec<u8> {
        ::hex::decode(s).unwrap()
    }

    #[test]
    fn integer_heads_use_smallest_form() {
        assert_eq!(encode(&CborValue::Unsigned(0)), hex("00"));
        assert_eq!(encode(&CborValue::Unsigned(23)), hex("17"));
        assert_eq!(encode(&CborValue::Unsigned(24)), hex("1818"));
        assert_eq!(encode(&CborValue::Unsigned(1000)), hex("1903e8"));
        assert_eq!(encode(&CborValue::Unsigned(1_000_000)), hex("1a000f4240"));
        assert_eq!(encode(&CborValue::integer(-1)), hex("20"));
        assert_eq!(encode(&CborValue::integer(-100)), hex("3863"));
    }

    #[test]
    fn decodes_rfc_examples() {
        assert_eq!(decode(&hex("f93c00")).unwrap(), CborValue::Float(1.0));
        assert_eq!(decode(&hex("f9c400")).unwrap(), CborValue::Float(-4.0));
        assert_eq!(decode(&hex("f90001")).unwrap(), CborValue::Float(5.960_464_477_539_063e-8));
        assert_eq!(decode(&hex("fa47c35000")).unwrap(), CborValue::Float(100_000.0));
        assert_eq!(decode(&hex("fb3ff199999999999a")).unwrap(), CborValue::Float(1.1));
        assert_eq!(decode(&hex("3903e7")).unwrap().as_i64(), Some(-1000));
        assert_eq!(
            decode(&hex("c074323031332d30332d32315432303a30343a30305a")).unwrap(),
            CborValue::Tag(0, Box::new(CborValue::Text("2013-03-21T20:04:00Z".into())))
        );
    }

    #[test]
    fn decodes_indefinite_lengths() {
        assert_eq!(
            decode(&hex("5f42010243030405ff")).unwrap(),
            CborValue::Bytes(vec![1, 2, 3, 4, 5])
        );
        assert_eq!(
            decode(&hex("7f657374726561646d696e67ff")).unwrap(),
            CborValue::Text("streaming".into())
        );
        assert_eq!(
            decode(&hex("9f018202039f0405ffff")).unwrap(),
            CborValue::Array(vec![
                CborValue::Unsigned(1),
                CborValue::Array(vec![CborValue::Unsigned(2), CborValue::Unsigned(3)]),
                CborValue::Array(vec![CborValue::Unsigned(4), CborValue::Unsigned(5)]),
            ])
        );
        let map = decode(&hex("bf61610161629f0203ffff")).unwrap();
        assert_eq!(map.get("a").and_then(CborValue::as_u64), Some(1));
        assert_eq!(map.get("b").and_then(CborValue::as_array).map(<[_]>::len), Some(2));
    }

    #[test]
    fn map_round_trip_keeps_order() {
        let value = CborValue::map([
            ("data", CborValue::Bytes(vec![0xAA; 30])),
            ("off", CborValue::Unsigned(0)),
            ("len", CborValue::Unsigned(70_000)),
            ("confirm", CborValue::Bool(false)),
            ("v", CborValue::Null),
        ]);
        let bytes = encode(&value);
        assert_eq!(bytes[0], 0xA5);
        assert_eq!(&bytes[1..6], b"\x64data");
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn truncated_input_reports_offset() {
        let err = decode(&hex("1903")).unwrap_err();
        assert!(matches!(err, Error::Cbor { offset: 1, .. }));
        let err = decode(&hex("8201")).unwrap_err();
        assert!(matches!(err, Error::Cbor { .. }));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(decode(&hex("0000")).is_err());
    }

    #[test]
    fn empty_body_is_empty_map() {
        assert_eq!(decode(&[]).unwrap(), CborValue::Map(Vec::new()));
    }

    #[test]
    fn head_len_matches_encoder() {
        for n in [0u64, 23, 24, 255, 256, 65_535, 65_536, u64::from(u32::MAX) + 1] {
            let mut out = Vec::new();
            write_head(&mut out, 2, n);
            assert_eq!(out.len(), head_len(n), "n = {n}");
        }
    }
}
