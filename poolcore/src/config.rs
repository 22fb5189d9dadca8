use crate::helpe::*;

/// Block length used when nobody configured one.
pub const DEFAULT_BLOCK_KEYS: u64 = 1_000_000_000_000;

/// Everything one puzzle needs: where it lives, how big its blocks are, and
/// how the coordinator behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub puzzle:     BigRange,
    pub sizes:      SizePolicy,
    pub allocator:  AllocatorConfig,
}

impl PoolConfig {
    /// Refuses a puzzle without a single key in it.
    pub fn new(puzzle: BigRange, sizes: SizePolicy, allocator: AllocatorConfig) -> PoolResult<Self> {
        if puzzle.length()?.is_zero() {
            return Err(PoolError::InvalidConfig(format!("puzzle range {puzzle} is empty")));
        }

        Ok(Self { puzzle, sizes, allocator })
    }

    /// Builds the config from its textual pieces: hex puzzle bounds and
    /// optional block lengths (see [`parse_length`]). A missing minimum
    /// means [`DEFAULT_BLOCK_KEYS`], a missing maximum means the minimum.
    pub fn from_text(
        start:      &str,
        end:        &str,
        min_keys:   Option<&str>,
        max_keys:   Option<&str>,
        allocator:  AllocatorConfig,
    ) -> PoolResult<Self> {
        let puzzle = BigRange::new(parse_hex_key(start)?, parse_hex_key(end)?)
            .map_err(|_| PoolError::InvalidConfig(format!("puzzle end {end} lies below its start {start}")))?;
        let min = match min_keys {
            Some(t) => parse_length(t)?,
            None    => KeyInt::from(DEFAULT_BLOCK_KEYS),
        };
        let max = match max_keys {
            Some(t) => parse_length(t)?,
            None    => min.clone(),
        };

        Self::new(puzzle, SizePolicy::new(min, max), allocator)
    }
}

/// Parses a block length: a decimal count with an optional `K`, `M`, `B`
/// or `T` suffix (thousands up to trillions, case-insensitive), or a `0x`
/// hex value.
pub fn parse_length(text: &str) -> PoolResult<KeyInt> {
    let t = text.trim();
    if t.starts_with("0x") || t.starts_with("0X") {
        return parse_key(t);
    }
    let (digits, scale) = match t.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let scale: u64 = match c.to_ascii_uppercase() {
                'K' => 1_000,
                'M' => 1_000_000,
                'B' => 1_000_000_000,
                'T' => 1_000_000_000_000,
                _   => return Err(PoolError::InvalidNumber(text.to_owned())),
            };
            (&t[..i], scale)
        },
        _   => (t, 1),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(PoolError::InvalidNumber(text.to_owned()));
    }

    Ok(parse_key(digits)? * scale)
}
