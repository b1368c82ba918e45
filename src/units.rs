use crate::errors::VmError;

/// Parse a size string like "1G", "512MiB", "4096" (raw bytes) into bytes.
/// Suffixes are 1024-based and case-insensitive.
pub fn parse_size(input: &str) -> Result<u64, VmError> {
    let trimmed = input.trim();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    let suffix = trimmed[digits.len()..].trim().to_lowercase();
    if digits.is_empty() {
        return Err(VmError::InvalidInput(format!("invalid size '{input}'")));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| VmError::InvalidInput(format!("invalid size '{input}'")))?;
    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(VmError::InvalidInput(format!(
                "invalid size suffix '{suffix}' in '{input}'"
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| VmError::InvalidInput(format!("size '{input}' overflows")))
}

/// Render a byte count as a human-readable 1024-based unit string.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
