//! Size alignment to block granularity
//!
//! Volumes on the appliance must be exact multiples of the backing
//! format's block size. Alignment runs before capacity checks and remote
//! creation so everything downstream sees the true to-be-allocated size.

/// Parse a granularity string ("512", "16K", "128k", "1M", "4G") into bytes.
///
/// Returns `None` for empty, zero, or unparseable input; callers treat
/// that as "no alignment".
pub fn parse_granularity(spec: &str) -> Option<u64> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }

    let (digits, multiplier) = match spec.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&spec[..spec.len() - 1], 1024u64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&spec[..spec.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&spec[..spec.len() - 1], 1024 * 1024 * 1024),
        _ => (spec, 1),
    };

    let value: u64 = digits.parse().ok()?;
    let bytes = value.checked_mul(multiplier)?;
    if bytes == 0 {
        return None;
    }
    Some(bytes)
}

/// Round `requested` up to the smallest multiple of the configured
/// granularity. Returns the input unchanged when no usable granularity is
/// configured or the size is already aligned.
pub fn align_size(requested: u64, granularity: Option<&str>) -> u64 {
    let Some(gran) = granularity.and_then(parse_granularity) else {
        return requested;
    };

    let remainder = requested % gran;
    if remainder == 0 {
        return requested;
    }

    let aligned = requested + (gran - remainder);
    log::info!(
        "aligning volume size {} -> {} (blocksize {})",
        requested,
        aligned,
        gran
    );
    aligned
}
