pub(crate) mod env;

/// Microseconds since the process-wide epoch, used for progress pacing and
/// accumulated statistics.
pub(crate) fn current_time_us() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

pub(crate) fn page_size() -> usize {
    // Safety: sysconf is always callable.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(sz > 0, "failed to query page size");
    let sz = sz as usize;
    assert!(sz.is_power_of_two());
    sz
}

/// Round `size` up to the next multiple of the page size.
pub(crate) fn round_to_page(size: usize) -> usize {
    let mask = page_size() - 1;
    (size + mask) & !mask
}

/// Pin the calling thread to `core` (best effort).
pub(crate) fn pin_to_core(core: usize) {
    // Safety: cpu_set_t is a plain bitset, zeroed is a valid value.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % libc::CPU_SETSIZE as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(core, "failed to pin thread");
        }
    }
}

/// Number of NUMA nodes reported by the kernel, 1 if unknown.
pub(crate) fn num_numa_nodes() -> usize {
    match std::fs::read_to_string("/sys/devices/system/node/online") {
        Ok(s) => parse_cpu_list(s.trim()).max(1),
        Err(_) => 1,
    }
}

// Parses kernel range lists such as "0-3" or "0,2-3" into a count.
fn parse_cpu_list(s: &str) -> usize {
    s.split(',')
        .map(|part| {
            let mut ends = part.splitn(2, '-');
            let lo: usize = ends.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            match ends.next().and_then(|v| v.parse::<usize>().ok()) {
                Some(hi) if hi >= lo => hi - lo + 1,
                _ => 1,
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let page = page_size();
        assert_eq!(round_to_page(1), page);
        assert_eq!(round_to_page(page), page);
        assert_eq!(round_to_page(page + 1), 2 * page);
    }

    #[test]
    fn cpu_list_parsing() {
        assert_eq!(parse_cpu_list("0"), 1);
        assert_eq!(parse_cpu_list("0-3"), 4);
        assert_eq!(parse_cpu_list("0,2-3"), 3);
    }
}
