//! Model tier assignment.
//!
//! A tier is a 1–9 capability ordinal. Known models get an exact tier from
//! the static table; everything else is estimated from its on-disk size.

/// Substring-matched tier table, checked in order. First hit wins, so more
/// specific names come first.
const TIER_TABLE: &[(&str, u8)] = &[
    ("claude-opus", 9),
    ("opus", 9),
    ("claude-3-5-sonnet", 8),
    ("claude-sonnet", 8),
    ("sonnet", 8),
    ("claude-haiku", 6),
    ("haiku", 6),
    ("gpt-4o-mini", 6),
    ("gpt-4o", 8),
    ("gpt-4", 8),
    ("gpt-3.5", 5),
    ("llama3:70b", 7),
    ("llama3.1:70b", 7),
    ("mixtral", 6),
    ("llama3:8b", 4),
    ("llama3.1:8b", 4),
    ("llama3", 4),
    ("codellama", 5),
    ("mistral", 4),
    ("phi3", 3),
    ("gemma:2b", 2),
    ("gemma", 3),
    ("qwen2:0.5b", 1),
    ("tinyllama", 1),
];

/// Exact tier for a known model name, if any.
pub fn lookup(name: &str) -> Option<u8> {
    let lower = name.to_lowercase();
    TIER_TABLE
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, tier)| *tier)
}

/// Estimate a tier from model size in bytes. Rough but monotonic, which is
/// all selection needs.
pub fn estimate_from_size(size: u64) -> u8 {
    const GB: u64 = 1_000_000_000;
    match size {
        0 => 3,
        s if s < GB => 1,
        s if s < 3 * GB => 2,
        s if s < 5 * GB => 3,
        s if s < 9 * GB => 4,
        s if s < 20 * GB => 5,
        s if s < 45 * GB => 6,
        _ => 7,
    }
}

/// Tier for a model: table lookup first, size estimate otherwise.
pub fn assign(name: &str, size: u64) -> u8 {
    lookup(name).unwrap_or_else(|| estimate_from_size(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_get_table_tiers() {
        assert_eq!(lookup("claude-opus-4-6"), Some(9));
        assert_eq!(lookup("claude-3-5-sonnet-20241022"), Some(8));
        assert_eq!(lookup("llama3:8b-instruct"), Some(4));
        assert_eq!(lookup("made-up-model"), None);
    }

    #[test]
    fn size_estimation_is_monotonic() {
        let sizes = [
            500_000_000u64,
            2_000_000_000,
            4_000_000_000,
            8_000_000_000,
            15_000_000_000,
            40_000_000_000,
            70_000_000_000,
        ];
        let tiers: Vec<u8> = sizes.iter().map(|s| estimate_from_size(*s)).collect();
        assert_eq!(tiers, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn assign_prefers_the_table() {
        assert_eq!(assign("mixtral:8x7b", 26_000_000_000), 6);
        assert_eq!(assign("unknown", 2_000_000_000), 2);
    }
}
