//! Load balancing strategies shared by the service registry (C7) and the
//! worker pool's dispatch path (C9) (spec.md §4.2, §4.7).

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancingStrategy {
    RoundRobin,
    Random,
    Weighted,
    LeastConnections,
    ConsistentHash,
}

/// Anything a balancing strategy can pick among: an id to hash, a weight
/// for [`BalancingStrategy::Weighted`], and a load count for
/// [`BalancingStrategy::LeastConnections`].
pub trait Candidate {
    fn id(&self) -> &str;
    fn weight(&self) -> u32 {
        1
    }
    fn active_connections(&self) -> u64 {
        0
    }
}

/// FNV-1a, used both to place candidates on the hash ring and to hash the
/// lookup key.
pub fn fnv1a(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    input.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(PRIME)
    })
}

/// Picks the index of one candidate from `candidates` under `strategy`.
/// `round_robin_cursor` is the caller-owned cursor used (and advanced) by
/// [`BalancingStrategy::RoundRobin`]; `hash_key` is only consulted by
/// [`BalancingStrategy::ConsistentHash`], falling back to the first
/// candidate's id when absent so the pick is still deterministic.
///
/// Consistent hashing places each candidate's id and the key on the same
/// ring (by FNV-1a hash) and picks the candidate whose hash is the least
/// distance clockwise from the key's hash — so adding or removing one
/// candidate only reshuffles the keys that land in its arc, not the whole
/// keyspace (`service_mesh.py`'s `_consistent_hash_select`).
pub fn select_index<T: Candidate>(
    candidates: &[T],
    strategy: BalancingStrategy,
    hash_key: Option<&str>,
    round_robin_cursor: &mut usize,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        BalancingStrategy::RoundRobin => {
            let index = *round_robin_cursor % candidates.len();
            *round_robin_cursor = round_robin_cursor.wrapping_add(1);
            Some(index)
        }
        BalancingStrategy::Random => {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            Some(index)
        }
        BalancingStrategy::Weighted => {
            let total_weight: u32 = candidates.iter().map(|c| c.weight()).sum();
            if total_weight == 0 {
                return Some(0);
            }
            let mut pick = rand::thread_rng().gen_range(0..total_weight);
            for (index, candidate) in candidates.iter().enumerate() {
                if pick < candidate.weight() {
                    return Some(index);
                }
                pick -= candidate.weight();
            }
            Some(candidates.len() - 1)
        }
        BalancingStrategy::LeastConnections => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.active_connections())
            .map(|(index, _)| index),
        BalancingStrategy::ConsistentHash => {
            let key = hash_key.unwrap_or_else(|| candidates[0].id());
            let key_hash = fnv1a(key);
            candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| fnv1a(c.id()).wrapping_sub(key_hash))
                .map(|(index, _)| index)
        }
    }
}
