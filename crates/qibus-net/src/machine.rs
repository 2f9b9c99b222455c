//! Host identity and randomness helpers.

use std::sync::OnceLock;

/// Stable identifier of this machine.
///
/// Reads `/etc/machine-id`; hosts without one get a random identifier,
/// generated once per process.
pub fn machine_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| {
        if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
        let mut raw = [0u8; 16];
        fill_random(&mut raw);
        raw.iter().map(|b| format!("{b:02x}")).collect()
    })
}

/// A random `u64` from the OS RNG.
///
/// Used for subscription handler ids: with n live subscriptions the
/// collision probability is about n²/2⁶⁵, and a collision only aliases two
/// subscriptions of the same signal.
pub fn random_u64() -> u64 {
    let mut raw = [0u8; 8];
    fill_random(&mut raw);
    u64::from_le_bytes(raw)
}

fn fill_random(buf: &mut [u8]) {
    #[allow(clippy::expect_used)]
    getrandom::fill(buf).expect("OS RNG failure is unrecoverable");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable_and_non_empty() {
        let first = machine_id();
        assert!(!first.is_empty());
        assert_eq!(machine_id(), first);
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(random_u64(), random_u64());
    }
}
