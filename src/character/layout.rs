//! Region partitioning for multi-character panels.

use crate::types::CharacterBinding;

/// Fractions of the panel given to each of `regions` regions, summing to 1.
///
/// Explicit weights are used when there is exactly one positive finite weight per region;
/// anything else falls back to an even split.
pub fn region_fractions(weights: &[f32], regions: usize) -> Vec<f32> {
    if regions == 0 {
        return Vec::new();
    }
    let usable = weights.len() == regions && weights.iter().all(|w| w.is_finite() && *w > 0.0);
    if usable {
        let total: f32 = weights.iter().sum();
        if total.is_finite() && total > 0.0 {
            return weights.iter().map(|w| w / total).collect();
        }
    }
    vec![1.0 / regions as f32; regions]
}

/// Bindings in region order: pinned bindings by region index, then unpinned ones as given.
pub fn order_bindings(bindings: &[CharacterBinding]) -> Vec<&CharacterBinding> {
    let mut pinned: Vec<&CharacterBinding> =
        bindings.iter().filter(|b| b.region.is_some()).collect();
    pinned.sort_by_key(|b| b.region);
    pinned.extend(bindings.iter().filter(|b| b.region.is_none()));
    pinned
}
