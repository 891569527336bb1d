pub const DEFAULT_MAX_OBSERVATION: usize = 16 * 1024;

/// Truncate tool output if it exceeds `max_bytes`.
/// Cuts at a char boundary and appends a marker with original vs kept size.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut boundary = max_bytes;
    while !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}\n\n[truncated: {} bytes -> {} bytes]",
        &output[..boundary],
        output.len(),
        boundary
    )
}
