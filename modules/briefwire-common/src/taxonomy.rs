//! Preset L3 root categories for entity anchors.
//!
//! The root list is the single source of truth for the top tier of the
//! entity hierarchy. Deployments can override it via `[taxonomy] l3_roots`
//! in the config file; anything that doesn't resolve maps to [`OTHER_ROOT`].

/// The 18 default root categories.
pub const PRESET_L3_ROOTS: &[&str] = &[
    "AI",
    "Semiconductors",
    "Energy",
    "Biotech",
    "Space",
    "Robotics",
    "Consumer Tech",
    "Enterprise Software",
    "Internet",
    "Finance",
    "Crypto",
    "Macro",
    "Manufacturing",
    "Transportation",
    "Materials",
    "Defense",
    "Climate",
    "Media",
];

/// Fallback root for anything that cannot be resolved.
pub const OTHER_ROOT: &str = "Other";

/// Resolve a raw root label against a root set.
///
/// Matching order: exact match, then case-insensitive equality, then
/// case-insensitive substring containment in either direction. Unresolved
/// labels map to "Other".
pub fn resolve_l3_root(raw: &str, roots: &[String]) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return OTHER_ROOT.to_string();
    }

    if let Some(exact) = roots.iter().find(|r| r.as_str() == trimmed) {
        return exact.clone();
    }

    let lowered = trimmed.to_lowercase();
    if let Some(ci) = roots.iter().find(|r| r.to_lowercase() == lowered) {
        return ci.clone();
    }

    if let Some(contained) = roots.iter().find(|r| {
        let rl = r.to_lowercase();
        rl.contains(&lowered) || lowered.contains(&rl)
    }) {
        return contained.clone();
    }

    OTHER_ROOT.to_string()
}

/// The default root set as owned strings, for configs that don't override it.
pub fn default_roots() -> Vec<String> {
    PRESET_L3_ROOTS.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins() {
        let roots = default_roots();
        assert_eq!(resolve_l3_root("AI", &roots), "AI");
        assert_eq!(resolve_l3_root("Crypto", &roots), "Crypto");
    }

    #[test]
    fn case_insensitive_match() {
        let roots = default_roots();
        assert_eq!(resolve_l3_root("ai", &roots), "AI");
        assert_eq!(resolve_l3_root("FINANCE", &roots), "Finance");
    }

    #[test]
    fn substring_match_either_direction() {
        let roots = default_roots();
        // raw contains root
        assert_eq!(resolve_l3_root("Artificial AI systems", &roots), "AI");
        // root contains raw
        assert_eq!(resolve_l3_root("Semiconductor", &roots), "Semiconductors");
    }

    #[test]
    fn unknown_maps_to_other() {
        let roots = default_roots();
        assert_eq!(resolve_l3_root("Underwater Basket Weaving", &roots), "Other");
        assert_eq!(resolve_l3_root("", &roots), "Other");
        assert_eq!(resolve_l3_root("   ", &roots), "Other");
    }

    #[test]
    fn preset_has_eighteen_roots() {
        assert_eq!(PRESET_L3_ROOTS.len(), 18);
    }
}
