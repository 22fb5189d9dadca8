use crate::helpe::*;

impl BigRange {
    /// Creates a by-guarantee valid range. Empty ranges (`start == end`)
    /// are allowed here; [`Block`]s additionally demand length >= 1.
    pub fn new(start: KeyInt, end: KeyInt) -> PoolResult<Self> {
        if end < start {
            Err(PoolError::InvalidRange { start, end })
        } else {
            Ok(Self { start, end })
        }
    }

    /// Shorthand for tests and callers holding machine-sized bounds.
    pub fn from_u64(start: u64, end: u64) -> PoolResult<Self> {
        Self::new(KeyInt::from(start), KeyInt::from(end))
    }

    /// Parses two big integers (see [`parse_key`]) into a range.
    pub fn parse(start: &str, end: &str) -> PoolResult<Self> {
        Self::new(parse_key(start)?, parse_key(end)?)
    }

    /// Number of keys in the range.
    #[inline(always)]
    pub fn length(&self) -> PoolResult<KeyInt> {
        self.end
            .checked_sub(&self.start)
            .ok_or_else(|| PoolError::InvalidRange {
                start:  self.start.clone(),
                end:    self.end.clone(),
            })
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline(always)]
    pub fn contains(&self, key: &KeyInt) -> bool {
        &self.start <= key && key < &self.end
    }

    /// Returns `true` if `self` lies entirely inside `outer`.
    #[inline(always)]
    pub fn lies_within(&self, outer: &BigRange) -> bool {
        self.start >= outer.start && self.end <= outer.end
    }

    /// Two ranges intersect iff they share at least one key. Merely
    /// touching ranges (`a.end == b.start`) do not.
    #[inline(always)]
    pub fn intersects(&self, other: &BigRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The common part of both ranges, if non-empty.
    pub fn intersection(&self, other: &BigRange) -> Option<BigRange> {
        let start = (&self.start).max(&other.start);
        let end = (&self.end).min(&other.end);
        if start < end {
            Some(BigRange {
                start:  start.clone(),
                end:    end.clone(),
            })
        } else { None }
    }

    /// `max(0, min(end, other.end) - max(start, other.start))`
    #[inline(always)]
    pub fn intersection_length(&self, other: &BigRange) -> KeyInt {
        let start = (&self.start).max(&other.start);
        let end = (&self.end).min(&other.end);
        end.checked_sub(start).unwrap_or_default()
    }

    /// Unites `self` with `other` if they overlap or touch, i.e. if no key
    /// lies between them. Otherwise returns `None`.
    pub fn merge(&self, other: &BigRange) -> Option<BigRange> {
        if other.start <= self.end && self.start <= other.end {
            Some(BigRange {
                start:  (&self.start).min(&other.start).clone(),
                end:    (&self.end).max(&other.end).clone(),
            })
        } else { None }
    }

    /// Offset of `key` relative to our start, saturating at zero for keys
    /// that sit below it.
    #[inline(always)]
    pub fn offset_of(&self, key: &KeyInt) -> KeyInt {
        key.checked_sub(&self.start).unwrap_or_default()
    }
}

impl fmt::Display for BigRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.start, self.end)
    }
}

//---START TEXT CODEC
// Big integers cross every boundary as text. Hex carries a `0x` prefix;
// anything else is decimal. Leading zeros are fine on input (stores used to
// pad to 64 hex digits) and never produced on output.

/// Parses a `0x`-prefixed hex or a plain decimal big integer.
pub fn parse_key(text: &str) -> PoolResult<KeyInt> {
    let t = text.trim();
    match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex)   => parse_radix(text, hex, 16),
        None        => parse_radix(text, t, 10),
    }
}

/// Parses a hex big integer, with or without `0x`. Puzzle bounds are
/// configured this way.
pub fn parse_hex_key(text: &str) -> PoolResult<KeyInt> {
    let t = text.trim();
    let hex = t.strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    parse_radix(text, hex, 16)
}

fn parse_radix(text: &str, digits: &str, radix: u32) -> PoolResult<KeyInt> {
    // `from_str_radix` tolerates `+` and `_`, we do not.
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(PoolError::InvalidNumber(text.to_owned()));
    }
    KeyInt::from_str_radix(digits, radix)
        .map_err(|_| PoolError::InvalidNumber(text.to_owned()))
}

/// Compact `0x` hex; zero is `0x0`.
pub fn format_key(key: &KeyInt) -> String {
    format!("{key:#x}")
}

/// `0x` hex left-padded to 64 digits, the width of a 256-bit key.
pub fn format_key_padded(key: &KeyInt) -> String {
    format!("0x{key:064x}")
}

/// `serialize_with` helper writing a [`KeyInt`] the way [`format_key`] does.
pub fn serialize_key<S: serde::Serializer>(key: &KeyInt, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_key(key))
}

pub fn serialize_opt_key<S: serde::Serializer>(key: &Option<KeyInt>, s: S) -> Result<S::Ok, S::Error> {
    match key {
        Some(k) => s.serialize_some(&format_key(k)),
        None    => s.serialize_none(),
    }
}

/// How a [`BigRange`] travels through serde: both ends as hex strings.
#[derive(Serialize, Deserialize)]
pub struct RangeRepr {
    start:  String,
    end:    String,
}

impl From<BigRange> for RangeRepr {
    fn from(r: BigRange) -> Self {
        Self {
            start:  format_key(&r.start),
            end:    format_key(&r.end),
        }
    }
}

impl TryFrom<RangeRepr> for BigRange {
    type Error = PoolError;

    fn try_from(r: RangeRepr) -> Result<Self, Self::Error> {
        BigRange::parse(&r.start, &r.end)
    }
}
//---END TEXT CODEC

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: u64, e: u64) -> BigRange {
        BigRange::from_u64(s, e).unwrap()
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(matches!(
            BigRange::from_u64(5, 4),
            Err(PoolError::InvalidRange { .. })
        ));
        let inverted = BigRange { start: KeyInt::from(9u8), end: KeyInt::from(3u8) };
        assert!(matches!(inverted.length(), Err(PoolError::InvalidRange { .. })));
        assert!(r(7, 7).is_empty());
    }

    #[test]
    fn intersection_semantics() {
        assert!(r(0, 10).intersects(&r(9, 12)));
        // Touching is not intersecting.
        assert!(!r(0, 10).intersects(&r(10, 12)));
        assert_eq!(r(0, 10).intersection_length(&r(4, 30)), KeyInt::from(6u8));
        assert_eq!(r(0, 10).intersection_length(&r(20, 30)), KeyInt::zero());
        assert_eq!(r(3, 8).intersection(&r(5, 20)), Some(r(5, 8)));
        assert_eq!(r(3, 8).intersection(&r(8, 20)), None);
    }

    #[test]
    fn merge_unites_touching_ranges_only() {
        assert_eq!(r(0, 10).merge(&r(10, 15)), Some(r(0, 15)));
        assert_eq!(r(5, 10).merge(&r(0, 7)), Some(r(0, 10)));
        assert_eq!(r(0, 10).merge(&r(11, 15)), None);
    }

    #[test]
    fn orders_by_start_then_end() {
        let sorted = vec![r(5, 9), r(1, 20), r(5, 6), r(0, 1)]
            .into_iter()
            .sorted()
            .collect_vec();
        assert_eq!(sorted, vec![r(0, 1), r(1, 20), r(5, 6), r(5, 9)]);
    }

    #[test]
    fn keys_beyond_machine_words_survive() {
        let top = (KeyInt::one() << 256u32) - KeyInt::one();
        let range = BigRange::new(KeyInt::one() << 255u32, top.clone()).unwrap();
        assert_eq!(range.length().unwrap(), (KeyInt::one() << 255u32) - KeyInt::one());
        let text = format_key(&top);
        assert_eq!(text.len(), 2 + 64);
        assert_eq!(parse_key(&text).unwrap(), top);
    }

    #[test]
    fn text_codec() {
        assert_eq!(parse_key("0x10").unwrap(), KeyInt::from(16u8));
        assert_eq!(parse_key(" 4096 ").unwrap(), KeyInt::from(4096u16));
        assert_eq!(parse_hex_key("ff").unwrap(), KeyInt::from(255u8));
        assert_eq!(parse_hex_key("0x00000000ff").unwrap(), KeyInt::from(255u8));
        assert_eq!(format_key(&KeyInt::zero()), "0x0");
        assert_eq!(format_key_padded(&KeyInt::from(255u8)).len(), 66);
        for bad in ["", "0x", "12a", "0xzz", "+5", "1_000", "-3"] {
            assert!(matches!(parse_key(bad), Err(PoolError::InvalidNumber(_))), "{bad}");
        }
        assert_eq!(r(0x10, 0x20).to_string(), "0x10:0x20");
    }

    #[test]
    fn serde_uses_hex_strings() {
        let json = serde_json::to_string(&r(16, 255)).unwrap();
        assert_eq!(json, r#"{"start":"0x10","end":"0xff"}"#);
        let back: BigRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r(16, 255));
        assert!(serde_json::from_str::<BigRange>(r#"{"start":"0x20","end":"0x10"}"#).is_err());
    }
}
