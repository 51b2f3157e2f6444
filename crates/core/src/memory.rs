//! Available-memory lookup and queue sizing.

use crate::error::{PipelineError, Result};

/// Upper bound on the capacity of any single queue.
pub const MAX_QUEUE_CAPACITY: usize = 50;

/// Assumed when `/proc/meminfo` cannot be read.
const FALLBACK_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Bytes of memory available to the job.
pub fn available_memory_bytes() -> u64 {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(text) => parse_meminfo(&text).unwrap_or_else(|| {
            log::warn!("no memory figure in /proc/meminfo, assuming {FALLBACK_MEMORY_BYTES} bytes");
            FALLBACK_MEMORY_BYTES
        }),
        Err(err) => {
            log::warn!("cannot read /proc/meminfo ({err}), assuming {FALLBACK_MEMORY_BYTES} bytes");
            FALLBACK_MEMORY_BYTES
        }
    }
}

/// `MemAvailable`, falling back to `MemTotal`, in bytes.
fn parse_meminfo(text: &str) -> Option<u64> {
    let field = |name: &str| {
        text.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?;
            let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            kib.checked_mul(1024)
        })
    };
    field("MemAvailable:").or_else(|| field("MemTotal:"))
}

/// Capacity of each of the `queues` frame queues.
///
/// Every queue may hold frames of up to `frame_bytes`, counted twice for the
/// tokenized copy. The total must stay under `fraction` of `available` bytes.
pub fn estimate_queue_capacity(
    available: u64,
    fraction: f64,
    frame_bytes: u64,
    queues: usize,
) -> Result<usize> {
    let budget = (available as f64 * fraction) as u64;
    let per_slot = frame_bytes
        .saturating_mul(queues.max(1) as u64)
        .saturating_mul(2);
    let capacity = if per_slot == 0 { 0 } else { budget / per_slot };
    if capacity == 0 {
        return Err(PipelineError::Config(format!(
            "{budget} bytes of memory cannot hold one {frame_bytes}-byte frame in each of {queues} queues; \
             lower read_chunk_size or raise fraction_of_RAM_alloted"
        )));
    }
    Ok((capacity as usize).min(MAX_QUEUE_CAPACITY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16000 kB\nMemFree:  100 kB\nMemAvailable:   8000 kB\n";
        assert_eq!(parse_meminfo(text), Some(8000 * 1024));
        assert_eq!(parse_meminfo("MemTotal: 2 kB\n"), Some(2048));
        assert_eq!(parse_meminfo("nothing"), None);
    }

    #[test]
    fn test_queue_capacity() {
        let mib = 1024 * 1024;
        assert_eq!(estimate_queue_capacity(1000 * mib, 1.0, mib, 4).unwrap(), 50);
        assert_eq!(estimate_queue_capacity(80 * mib, 0.5, mib, 4).unwrap(), 5);
        assert!(matches!(
            estimate_queue_capacity(mib, 0.5, mib, 4),
            Err(PipelineError::Config(_))
        ));
    }
}
