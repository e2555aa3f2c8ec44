//! Environment variable parsing for runtime configuration.
//!
//! All recognized variables are prefixed with `TASKMESH_`; builder settings
//! always win over the environment.

use std::env;

pub(crate) const ENV_PREFIX: &str = "TASKMESH_";

fn lookup(name: &str) -> Option<String> {
    let mut key = String::with_capacity(ENV_PREFIX.len() + name.len());
    key.push_str(ENV_PREFIX);
    key.push_str(name);
    env::var(key).ok().filter(|v| !v.is_empty())
}

pub(crate) fn number(name: &str) -> Option<usize> {
    lookup(name).and_then(|v| match v.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(name, value = %v, "ignoring unparsable numeric option");
            None
        }
    })
}

pub(crate) fn boolean(name: &str) -> Option<bool> {
    lookup(name).map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Duration in microseconds.
pub(crate) fn micros(name: &str) -> Option<u64> {
    number(name).map(|n| n as u64)
}

/// Byte size, accepting an optional K/M/G suffix.
pub(crate) fn size(name: &str) -> Option<usize> {
    lookup(name).and_then(|v| {
        let v = v.trim();
        let (digits, mult) = match v.as_bytes().last() {
            Some(b'K') | Some(b'k') => (&v[..v.len() - 1], 1usize << 10),
            Some(b'M') | Some(b'm') => (&v[..v.len() - 1], 1usize << 20),
            Some(b'G') | Some(b'g') => (&v[..v.len() - 1], 1usize << 30),
            _ => (v, 1),
        };
        match digits.trim().parse::<usize>() {
            Ok(n) => Some(n * mult),
            Err(_) => {
                tracing::warn!(name, value = %v, "ignoring unparsable size option");
                None
            }
        }
    })
}

/// String-to-enum table lookup, case insensitive.
pub(crate) fn str2enum<T: Copy>(name: &str, table: &[(&str, T)]) -> Option<T> {
    lookup(name).and_then(|v| {
        let v = v.trim();
        for (key, val) in table {
            if key.eq_ignore_ascii_case(v) {
                return Some(*val);
            }
        }
        tracing::warn!(name, value = %v, "ignoring unknown option value");
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env mutation is process global; keep every case inside one test.
    #[test]
    fn parsing() {
        env::set_var("TASKMESH_TEST_NUM", "42");
        env::set_var("TASKMESH_TEST_BOOL", "yes");
        env::set_var("TASKMESH_TEST_SIZE", "2M");
        env::set_var("TASKMESH_TEST_ENUM", "usleep");

        assert_eq!(number("TEST_NUM"), Some(42));
        assert_eq!(boolean("TEST_BOOL"), Some(true));
        assert_eq!(size("TEST_SIZE"), Some(2 << 20));
        assert_eq!(str2enum("TEST_ENUM", &[("POLL", 0), ("USLEEP", 1)]), Some(1));
        assert_eq!(number("TEST_MISSING"), None);

        env::remove_var("TASKMESH_TEST_NUM");
        env::remove_var("TASKMESH_TEST_BOOL");
        env::remove_var("TASKMESH_TEST_SIZE");
        env::remove_var("TASKMESH_TEST_ENUM");
    }
}
