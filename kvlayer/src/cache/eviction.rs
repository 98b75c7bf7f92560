use super::entry::BufferEntry;
use std::collections::HashMap;

/// Evict least recently touched clean entries once `capacity` of them are cached
///
/// Evicts down to half the capacity so the pass runs in batches instead of on
/// every insert. Dirty and in-flight entries are neither removed nor counted,
/// so the buffer may hold more than `capacity` keys while writes are pending.
/// Returns the number of evicted entries.
pub(crate) fn evict_cold(entries: &mut HashMap<String, BufferEntry>, capacity: usize) -> usize {
    if capacity == 0 {
        return 0;
    }
    let evictable = entries.values().filter(|e| e.is_evictable()).count();
    if evictable < capacity {
        return 0;
    }

    let mut candidates: Vec<(u64, String)> = entries
        .iter()
        .filter(|(_, entry)| entry.is_evictable())
        .map(|(key, entry)| (entry.last_touched, key.clone()))
        .collect();
    candidates.sort_unstable_by_key(|(touched, _)| *touched);

    let excess = evictable - capacity / 2;
    for (_, key) in candidates.iter().take(excess) {
        entries.remove(key);
    }

    excess
}
