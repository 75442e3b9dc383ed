#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`. `align` must be a power of two.
#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    (value.wrapping_add(align).wrapping_sub(1)) & !align.wrapping_sub(1)
}

/// Same as [`align_usize`] but returns `None` instead of wrapping around.
#[inline]
pub const fn checked_align_usize(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

pub struct FormattedSize {
    pub size: f64,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = self.size / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 8f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

impl std::fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size: size as f64 }
}

/// Parses values such as `64K`, `16m`, `1Gb` or `4096`.
fn parse_size_with_factor(value: &str) -> Option<(f64, usize)> {
    let mut value = value.trim();

    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (number, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    number.parse::<f64>().ok().map(|x| (x, factor))
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let value = std::env::var(var).ok()?;
    let (value, factor) = parse_size_with_factor(&value)?;

    if value < 0.0 {
        return None;
    }

    Some((value * factor as f64) as usize)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_usize(0, 16), 0);
        assert_eq!(align_usize(1, 16), 16);
        assert_eq!(align_usize(16, 16), 16);
        assert_eq!(align_usize(17, 16), 32);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(8193, 4096), 8192);
        assert!(is_aligned(65536, 65536));
        assert!(!is_aligned(65536 + 16, 65536));
        assert_eq!(checked_align_usize(usize::MAX - 3, 16), None);
    }

    #[test]
    fn test_parse_sizes() {
        assert_eq!(parse_size_with_factor("4096"), Some((4096.0, 1)));
        assert_eq!(parse_size_with_factor("64K"), Some((64.0, 1024)));
        assert_eq!(parse_size_with_factor("16mb"), Some((16.0, 1024 * 1024)));
        assert_eq!(parse_size_with_factor("1G"), Some((1.0, 1024 * 1024 * 1024)));
        assert_eq!(parse_size_with_factor(""), None);
        assert_eq!(parse_size_with_factor("lots"), None);
    }

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(64 * 1024).to_string(), "64.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }
}
