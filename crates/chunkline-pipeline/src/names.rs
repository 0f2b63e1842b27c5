//! Tensor names shared by chunk models, the maintenance model and the
//! sampling model.

pub const INPUT_IDS: &str = "input_ids";
pub const FULL_SEQUENCE_LENGTH: &str = "full_sequence_length";
pub const HIDDEN_STATE: &str = "x";
pub const LOGITS: &str = "logits";
pub const ARGMAX: &str = "argmax";

/// Any buffer whose name contains this is scoped to one chunk.
pub const CACHE_MARKER: &str = "cache";
pub const KEY_CACHE_PREFIX: &str = "k_cache_";
pub const VALUE_CACHE_PREFIX: &str = "v_cache_";
/// Prefix of the per-step cache slices a chunk produces.
pub const NEW_PREFIX: &str = "new_";

pub const OLD_K_CACHE: &str = "old_k_cache";
pub const NEW_K_CACHE: &str = "new_k_cache";
pub const OLD_V_CACHE: &str = "old_v_cache";
pub const NEW_V_CACHE: &str = "new_v_cache";
pub const UPDATED_K_CACHE: &str = "updated_k_cache";
pub const UPDATED_V_CACHE: &str = "updated_v_cache";

pub fn is_chunk_scoped(name: &str) -> bool {
    name.contains(CACHE_MARKER)
}

/// `k_cache_{b}` / `v_cache_{b}`: a cache input, not the `new_` slice.
pub fn is_cache_input(name: &str) -> bool {
    name.starts_with(KEY_CACHE_PREFIX) || name.starts_with(VALUE_CACHE_PREFIX)
}

/// `new_k_cache_{b}` / `new_v_cache_{b}`.
pub fn is_cache_output(name: &str) -> bool {
    name.strip_prefix(NEW_PREFIX).is_some_and(is_cache_input)
}

/// Block index of a `k_cache_{b}` name.
pub fn key_cache_block(name: &str) -> Option<usize> {
    name.strip_prefix(KEY_CACHE_PREFIX)?.parse().ok()
}

pub fn key_cache(block: usize) -> String {
    format!("{KEY_CACHE_PREFIX}{block}")
}

pub fn value_cache(block: usize) -> String {
    format!("{VALUE_CACHE_PREFIX}{block}")
}

pub fn new_slice(name: &str) -> String {
    format!("{NEW_PREFIX}{name}")
}

/// Part index of a split logits output: `logits` is part 0 of 1,
/// `logits_{i}` is part `i`.
pub fn logits_part(name: &str) -> Option<usize> {
    if name == LOGITS {
        return Some(0);
    }
    name.strip_prefix(LOGITS)?.strip_prefix('_')?.parse().ok()
}
