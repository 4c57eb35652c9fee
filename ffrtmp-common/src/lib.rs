pub mod api;
pub mod config;
pub mod metrics;
pub mod model;
pub mod retries;
pub mod tracing;

#[cfg(test)]
test_r::enable!();

/// Renders a value for user-facing output without leaking internals.
///
/// Error and config types implement this instead of relying on their
/// `Display`, so secrets and internal error chains never reach API
/// responses or dumped configuration.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Constant-time equality for API key comparison.
pub fn constant_time_eq(lhs: &str, rhs: &str) -> bool {
    let lhs = lhs.as_bytes();
    let rhs = rhs.as_bytes();
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
