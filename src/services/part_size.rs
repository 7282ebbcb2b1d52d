//! Part size planning.
//!
//! Backends bound both the size of a single part and the number of parts one
//! upload may have. The planner picks the size every part of an upload (except
//! the last) is cut to.

/// Bounds the planner works within.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSizeLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub preferred_part_size: u64,
    pub max_part_count: u64,
}

impl Default for PartSizeLimits {
    /// S3's limits: parts between 5 MiB and 5 GiB, at most 10 000 of them.
    fn default() -> Self {
        Self {
            min_part_size: 5 * 1024 * 1024,
            max_part_size: 5 * 1024 * 1024 * 1024,
            preferred_part_size: 50 * 1024 * 1024,
            max_part_count: 10_000,
        }
    }
}

impl PartSizeLimits {
    /// Reject bounds the planner cannot honour. The planner itself never
    /// re-clamps, so a preferred size outside `[min, max]` must be caught here.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_part_count == 0 {
            return Err("max part count must be positive".into());
        }
        if self.min_part_size > self.max_part_size {
            return Err(format!(
                "min part size {} exceeds max part size {}",
                self.min_part_size, self.max_part_size
            ));
        }
        if self.preferred_part_size == 0
            || self.preferred_part_size < self.min_part_size
            || self.preferred_part_size > self.max_part_size
        {
            return Err(format!(
                "preferred part size {} must lie within [{}, {}]",
                self.preferred_part_size, self.min_part_size, self.max_part_size
            ));
        }
        Ok(())
    }
}

/// Part size for an upload of `size` bytes (`None` while the length is
/// deferred).
///
/// Small and medium uploads use the preferred size. Larger ones are split into
/// exactly `max_part_count` parts, rounding up. A result outside
/// `[min, max]` falls back to the preferred size as-is.
pub fn optimal_part_size(size: Option<u64>, limits: &PartSizeLimits) -> u64 {
    let preferred = limits.preferred_part_size;
    let count = limits.max_part_count.max(1);

    let planned = match size {
        None => preferred,
        Some(n) if n <= preferred || n <= preferred.saturating_mul(count) => preferred,
        Some(n) if n % count == 0 => n / count,
        Some(n) => n / count + 1,
    };

    if planned > limits.max_part_size || planned < limits.min_part_size {
        preferred
    } else {
        planned
    }
}
