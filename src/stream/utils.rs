use rand::{Rng, RngCore, seq::index};

/// With probability `rate`, flips the bits of half the payload bytes
/// (at least one), chosen at distinct random positions.
///
/// Returns whether the payload was touched. Empty payloads never are.
pub fn maybe_corrupt(payload: &mut [u8], rate: f64, rng: &mut dyn RngCore) -> bool {
    if payload.is_empty() || rate <= 0.0 || rng.random::<f64>() >= rate {
        return false;
    }

    let count = (payload.len() / 2).max(1);
    for position in index::sample(rng, payload.len(), count) {
        payload[position] ^= 0xFF;
    }
    true
}
