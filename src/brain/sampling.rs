//! Seed derivation and weighted sampling shared by the brains

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Stable across runs and platforms, unlike `DefaultHasher`
pub fn derive_seed(root: u64, contest: u64, tag: &str, size: usize) -> u64 {
    let mut h = FNV_OFFSET;
    for byte in tag.bytes() {
        h ^= byte as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    splitmix64(root ^ splitmix64(contest ^ splitmix64(h ^ size as u64)))
}

pub fn seeded_rng(root: u64, contest: u64, tag: &str, size: usize) -> StdRng {
    StdRng::seed_from_u64(derive_seed(root, contest, tag, size))
}

/// Draw `k` distinct items, each with probability proportional to its weight.
/// Uses exponential keys (Efraimidis-Spirakis); non-positive weights only win
/// once every positive-weight item is taken.
pub fn weighted_sample_distinct(pool: &[(u8, f64)], k: usize, rng: &mut impl Rng) -> Vec<u8> {
    let mut keyed: Vec<(f64, u8)> = pool
        .iter()
        .map(|&(item, weight)| {
            let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            let key = if weight > 0.0 && weight.is_finite() {
                u.ln() / weight
            } else {
                f64::NEG_INFINITY
            };
            (key, item)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    keyed.into_iter().take(k).map(|(_, item)| item).collect()
}

/// Numbers ranked by descending weight, ties broken by the smaller number
pub fn rank_by_weight(weights: &[(u8, f64)]) -> Vec<u8> {
    let mut ranked = weights.to_vec();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().map(|(n, _)| n).collect()
}

/// Take `k_core` numbers from the weighted core, then complete the ticket to
/// `size` from the rest of the universe
pub fn core_then_fill(
    core: &[(u8, f64)],
    k_core: usize,
    fill: &[(u8, f64)],
    size: usize,
    rng: &mut impl Rng,
) -> Vec<u8> {
    let mut picked = weighted_sample_distinct(core, k_core.min(size), rng);
    let rest: Vec<(u8, f64)> = fill
        .iter()
        .filter(|(n, _)| !picked.contains(n))
        .copied()
        .collect();
    let missing = size.saturating_sub(picked.len());
    picked.extend(weighted_sample_distinct(&rest, missing, rng));
    picked.sort_unstable();
    picked
}

/// Call `build` until `count` distinct tickets exist or the retry allowance
/// (three builds per requested ticket) runs out
pub fn distinct_tickets<R: Rng>(
    count: usize,
    rng: &mut R,
    mut build: impl FnMut(&mut R) -> Vec<u8>,
) -> (Vec<Vec<u8>>, u32) {
    let mut seen = BTreeSet::new();
    let mut tickets = Vec::with_capacity(count);
    let mut tries = 0usize;
    while tickets.len() < count && tries < count * 3 {
        tries += 1;
        let ticket = build(rng);
        if seen.insert(ticket.clone()) {
            tickets.push(ticket);
        }
    }
    let failed = (count - tickets.len()) as u32;
    (tickets, failed)
}
