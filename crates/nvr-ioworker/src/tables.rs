//! Lookup tables that turn one `random()` draw into an opcode, an I/O
//! size, or an LBA section.

/// One LBA window of the distribution table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Section {
    pub lba_start: u64,
    pub lba_end: u64,
}

/// 100-slot opcode table: `op_table[random % 100]` indexes the op list.
/// Weights must sum to 100.
pub(crate) fn build_op_table(weights: &[u32]) -> Vec<u32> {
    let mut table = Vec::with_capacity(100);
    for (idx, &w) in weights.iter().enumerate() {
        table.extend(std::iter::repeat(idx as u32).take(w as usize));
    }
    debug_assert_eq!(table.len(), 100);
    table
}

/// Size table: `sl_table[random % ratio_sum]` indexes the size list.
pub(crate) fn build_size_table(ratios: &[u32]) -> Vec<u32> {
    let sum: u32 = ratios.iter().sum();
    let mut table = Vec::with_capacity(sum as usize);
    for (idx, &r) in ratios.iter().enumerate() {
        table.extend(std::iter::repeat(idx as u32).take(r as usize));
    }
    table
}

/// 10,000-slot section table. The namespace is cut into 100 equal
/// sections; each section occupies as many slots as its weight. The last
/// section is stretched to the region end so the tail past `lba_max/100 *
/// 100` stays reachable.
pub(crate) fn build_distribution_table(
    weights: &[u32],
    lba_max: u64,
    region_end: u64,
) -> Vec<Section> {
    let lba_section = lba_max / 100;
    let mut table = Vec::with_capacity(10_000);
    for (i, &w) in weights.iter().enumerate() {
        let lba_start = lba_section * i as u64;
        let lba_end = if i == 99 {
            region_end
        } else {
            lba_start + lba_section
        };
        table.extend(std::iter::repeat(Section { lba_start, lba_end }).take(w as usize));
    }
    debug_assert_eq!(table.len(), 10_000);
    table
}

pub(crate) fn align_up(n: u64, a: u64) -> u64 {
    match n % a {
        0 => n,
        r => n + a - r,
    }
}

pub(crate) fn align_down(n: u64, a: u64) -> u64 {
    n - n % a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_table_covers_weights_in_order() {
        let t = build_op_table(&[70, 20, 10]);
        assert_eq!(t.len(), 100);
        assert_eq!(t[0], 0);
        assert_eq!(t[69], 0);
        assert_eq!(t[70], 1);
        assert_eq!(t[89], 1);
        assert_eq!(t[90], 2);
        assert_eq!(t[99], 2);
    }

    #[test]
    fn size_table_single_entry() {
        let t = build_size_table(&[10]);
        assert_eq!(t.len(), 10);
        assert!(t.iter().all(|&i| i == 0));
    }

    #[test]
    fn size_table_dual_ratio() {
        let t = build_size_table(&[1, 2]);
        assert_eq!(t, vec![0, 1, 1]);
    }

    #[test]
    fn size_table_jedec_workload_ratios() {
        // The JEDEC 219 enterprise mix: 12 sizes, ratios summing to 100.
        let t = build_size_table(&[4, 1, 1, 1, 1, 1, 1, 67, 10, 7, 3, 3]);
        assert_eq!(t.len(), 100);
        assert_eq!(t[0], 0);
        assert_eq!(t[3], 0);
        assert_eq!(t[4], 1);
        assert_eq!(t[5], 2);
        assert_eq!(t[10], 7);
        assert_eq!(t[76], 7);
        assert_eq!(t[77], 8);
        assert_eq!(t[86], 8);
        assert_eq!(t[87], 9);
        assert_eq!(t[93], 9);
        assert_eq!(t[94], 10);
        assert_eq!(t[96], 10);
        assert_eq!(t[97], 11);
        assert_eq!(t[99], 11);
    }

    #[test]
    fn distribution_table_single_hot_section() {
        let mut weights = vec![0u32; 100];
        weights[37] = 10_000;
        let t = build_distribution_table(&weights, 100_000, 100_000);
        assert_eq!(t.len(), 10_000);
        assert!(t.iter().all(|s| s.lba_start == 37_000 && s.lba_end == 38_000));
    }

    #[test]
    fn distribution_table_last_section_reaches_region_end() {
        let weights = vec![100u32; 100];
        let t = build_distribution_table(&weights, 20_001, 20_001);
        assert_eq!(t.len(), 10_000);
        // Section width truncates to 200; the last section absorbs the
        // remainder.
        assert_eq!(t[0], Section { lba_start: 0, lba_end: 200 });
        assert_eq!(
            t[9_999],
            Section {
                lba_start: 19_800,
                lba_end: 20_001
            }
        );
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_down(5, 4), 4);
        assert_eq!(align_down(8, 4), 8);
    }
}
