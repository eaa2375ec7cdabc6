// SPDX-License-Identifier: Apache-2.0

//! The associative imprint index: find a tree's signature without building
//! a global canonical form.
//!
//! Interleave scheme: for each signature, `interleave` of the 9!
//! permutations — every `interleave_step`-th in lexicographic order — are
//! selected as *rows*; the signature tree's footprint under each row's
//! reverse permutation is added to the index. A query computes its
//! footprint under successive forward *columns* and probes each.
//!
//! The first `(9-k)!` transforms in lexicographic order form the pointwise
//! stabiliser of the first `k` slots, and every lexicographic block of
//! that size is one of its left cosets. Any query orientation therefore
//! lands on a stored row within the smallest such subgroup covering the
//! step — the probe span — so a miss is definitive after `probe_span`
//! columns. At a hit on column `c` against a row stored under transform
//! `row`, the permutation mapping the query onto the canonical member is
//! `inverse(fwd[row] ∘ fwd[c])`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{Imprint, Store};
use crate::transform;
use crate::tree::TinyTree;
use crate::MAX_TRANSFORM;

/// Lookup columns that guarantee a hit for an indexed signature: the
/// smallest prefix-stabiliser subgroup at least as large as the step.
pub fn probe_span(interleave_step: u32) -> u32 {
    const FACTORIALS: [u32; 10] = [1, 1, 2, 6, 24, 120, 720, 5_040, 40_320, 362_880];
    for f in FACTORIALS {
        if f >= interleave_step {
            return f;
        }
    }
    MAX_TRANSFORM
}

/// Statistics of an imprint rebuild pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RebuildStats {
    pub num_empty: u32,
    pub num_unsafe: u32,
    /// Signature id the pass stopped at when storage filled up.
    pub truncated_at: Option<u32>,
}

impl Store {
    /// Probe the index for `tree`'s signature.
    ///
    /// Returns `(sid, tid)` such that decoding the signature's canonical
    /// name under skin `tid` reproduces the query's structure, or `None`
    /// on a definitive miss.
    pub fn lookup_imprint_associative(&self, tree: &TinyTree) -> Option<(u32, u32)> {
        let span = probe_span(self.interleave_step);
        for col in 0..span {
            let fp = tree.footprint_under(self.fwd_packed(col));
            if let Some(iid) = self.find_imprint(&fp) {
                let imp = *self.imprint(iid);
                let row_perm = transform::unpack(self.fwd_packed(imp.tid));
                let col_perm = transform::unpack(self.fwd_packed(col));
                let composed = transform::rank(&transform::compose(&row_perm, &col_perm));
                return Some((imp.sid, self.rev_id(composed)));
            }
        }
        None
    }

    /// Add `tree`'s row footprints for signature `sid`.
    ///
    /// When a row's full 512-bit key already belongs to a different
    /// signature, the candidate is a duplicate of that class: its id is
    /// returned and nothing further is stored. Rows already present under
    /// the same signature are skin symmetries and are skipped.
    pub fn add_imprint_associative(&mut self, tree: &TinyTree, sid: u32) -> Result<u32> {
        debug_assert!(self.interleave > 0, "store has no interleave configured");
        for r in 0..self.interleave {
            let row = r * self.interleave_step;
            let fp = tree.footprint_under(self.rev_packed(row));
            match self.find_imprint(&fp) {
                Some(iid) => {
                    let found = self.imprint(iid).sid;
                    if found != sid {
                        return Ok(found);
                    }
                }
                None => {
                    self.add_imprint(Imprint {
                        footprint: fp,
                        sid,
                        tid: row,
                    })?;
                }
            }
        }
        Ok(sid)
    }

    /// Rebuild the imprint section from the signature table.
    ///
    /// `unsafe_only` restricts the pass to empty/unsafe signatures (the
    /// `--unsafe` mode); a sid window restricts it further. With
    /// `truncate` set the pass stops cleanly when the data table cannot
    /// hold another full row set.
    pub fn rebuild_imprints(
        &mut self,
        cfg: &Config,
        unsafe_only: bool,
        sid_lo: u32,
        sid_hi: u32,
        truncate: bool,
    ) -> Result<RebuildStats> {
        self.clear_imprints();

        let mut stats = RebuildStats::default();
        if self.num_signature() < 2 {
            return Ok(stats);
        }

        log::info!(
            "rebuilding imprints{} interleave={}",
            if unsafe_only { " for empty/unsafe signatures" } else { "" },
            self.interleave
        );
        if sid_lo != 0 || sid_hi != 0 {
            log::info!(
                "sid window: {}-{}",
                sid_lo,
                if sid_hi != 0 { sid_hi } else { self.num_signature() }
            );
        }

        let mut tree = TinyTree::new(cfg);

        for sid in 1..self.num_signature() {
            if (sid_lo != 0 && sid < sid_lo) || (sid_hi != 0 && sid >= sid_hi) {
                continue;
            }

            let sig = self.signature(sid);
            let first_member = sig.first_member;
            let is_safe = sig.is_safe();
            let name = sig.name_str().to_string();

            if !unsafe_only || !is_safe {
                if truncate
                    && sid_hi == 0
                    && self.max_imprint - self.num_imprint() <= self.interleave
                {
                    stats.truncated_at = Some(sid);
                    log::warn!("imprint storage full, truncating at sid={sid} \"{name}\"");
                    break;
                }

                tree.decode_fast(&name);
                if self.lookup_imprint_associative(&tree).is_none() {
                    match self.add_imprint_associative(&tree, sid) {
                        Ok(_) => {}
                        Err(Error::CapacityExceeded { section, .. }) => {
                            return Err(Error::CapacityExceeded {
                                section,
                                progress: sid as u64,
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            if first_member == 0 {
                stats.num_empty += 1;
            }
            if !is_safe {
                stats.num_unsafe += 1;
            }
        }

        log::info!(
            "created imprints: numImprint={} numEmpty={} numUnsafe={}",
            self.num_imprint(),
            stats.num_empty,
            stats.num_unsafe - stats.num_empty
        );
        Ok(stats)
    }

    /// Rebuild imprints for empty/unsafe signatures only, visiting them in
    /// increasing order of their measured imprint count (from the hint
    /// records). Small groups index first, which reduces the chance of
    /// hitting the data ceiling before they are covered.
    pub fn rebuild_imprints_with_hints(
        &mut self,
        cfg: &Config,
        truncate: bool,
    ) -> Result<RebuildStats> {
        if self.num_hint() < 2 {
            return Err(Error::Inconsistent(
                "hint section required for hint-ordered rebuild".to_string(),
            ));
        }

        self.clear_imprints();

        let mut stats = RebuildStats::default();
        if self.num_signature() < 2 {
            return Ok(stats);
        }

        log::info!("rebuilding imprints with hints, interleave={}", self.interleave);

        let active = crate::metrics::interleave_index(self.interleave).unwrap_or(0);

        let mut order: Vec<u32> = (1..self.num_signature())
            .filter(|&sid| !self.signature(sid).is_safe())
            .collect();
        order.sort_by(|&l, &r| {
            let hl = self.hint(self.signature(l).hint_id);
            let hr = self.hint(self.signature(r).hint_id);
            // Active preset count first (lowest first), then the other
            // presets highest first.
            hl.num_stored[active]
                .cmp(&hr.num_stored[active])
                .then_with(|| {
                    for j in 0..crate::store::HINT_WIDTH {
                        if j != active {
                            let c = hr.num_stored[j].cmp(&hl.num_stored[j]);
                            if c != std::cmp::Ordering::Equal {
                                return c;
                            }
                        }
                    }
                    std::cmp::Ordering::Equal
                })
        });

        let mut tree = TinyTree::new(cfg);

        for &sid in &order {
            if truncate && self.max_imprint - self.num_imprint() <= self.interleave {
                stats.truncated_at = Some(sid);
                log::warn!(
                    "imprint storage full, truncating at sid={sid} \"{}\"",
                    self.signature(sid).name_str()
                );
                break;
            }

            let name = self.signature(sid).name_str().to_string();
            tree.decode_fast(&name);
            if self.lookup_imprint_associative(&tree).is_none() {
                self.add_imprint_associative(&tree, sid)?;
            }
        }

        for sid in 1..self.num_signature() {
            if self.signature(sid).first_member == 0 {
                stats.num_empty += 1;
            }
            if !self.signature(sid).is_safe() {
                stats.num_unsafe += 1;
            }
        }

        log::info!(
            "created imprints: numImprint={} numEmpty={} numUnsafe={}",
            self.num_imprint(),
            stats.num_empty,
            stats.num_unsafe - stats.num_empty
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::policy::{SectionPolicy, SizingOptions};
    use crate::store::{pack_name, Signature};
    use crate::tree::name_counts;

    fn build_store(interleave: u32) -> Store {
        let db = Store::new_root();
        let mut policy = SectionPolicy::new(SizingOptions {
            max_signature: 64,
            max_member: 64,
            max_pair: 64,
            max_hint: 8,
            max_imprint: 64 * interleave + 1,
            interleave,
            ..SizingOptions::default()
        });
        policy.prepare_member_collection(&db, false);
        let params = policy.size_sections(&db, 1, false).unwrap();
        policy.populate(&params, &db, 0).unwrap()
    }

    fn add_signature_tree(store: &mut Store, name: &str) -> u32 {
        let cfg = Config::default();
        let mut tree = TinyTree::new(&cfg);
        tree.decode_safe(name).unwrap();
        let canonical = tree.encode(tree.root);
        let (nph, nep, nbr) = name_counts(&canonical);
        let sid = store
            .add_signature(Signature {
                name: pack_name(&canonical),
                size: tree.num_nodes() as u8,
                num_placeholder: nph as u8,
                num_endpoint: nep as u8,
                num_back_ref: nbr as u8,
                ..Signature::default()
            })
            .unwrap();
        let added = store.add_imprint_associative(&tree, sid).unwrap();
        assert_eq!(added, sid);
        sid
    }

    #[test]
    fn test_probe_span_is_next_factorial() {
        assert_eq!(probe_span(720), 720);
        assert_eq!(probe_span(504), 720);
        assert_eq!(probe_span(72), 120);
        assert_eq!(probe_span(1), 1);
        assert_eq!(probe_span(362_880), 362_880);
    }

    #[test]
    fn test_lookup_identity_returns_tid_zero() {
        let mut store = build_store(504);
        let sid = add_signature_tree(&mut store, "ab&");

        let cfg = Config::default();
        let mut query = TinyTree::new(&cfg);
        query.decode_safe("ab&").unwrap();
        let (found, tid) = store.lookup_imprint_associative(&query).unwrap();
        assert_eq!(found, sid);
        assert_eq!(tid, 0);
    }

    #[test]
    fn test_lookup_finds_permuted_query() {
        let mut store = build_store(504);
        let sid = add_signature_tree(&mut store, "ab>");

        // "ba>" is the same class under the a<->b swap.
        let cfg = Config::default();
        let mut query = TinyTree::new(&cfg);
        query.decode_safe("ba>").unwrap();
        let (found, tid) = store.lookup_imprint_associative(&query).unwrap();
        assert_eq!(found, sid);
        assert_ne!(tid, 0);

        // Decoding the stored name under the reported skin reproduces the
        // query structurally.
        let mut reconstructed = TinyTree::new(&cfg);
        reconstructed
            .decode_fast_with_skin(store.signature(sid).name_str(), store.fwd_name(tid));
        let fp_q = query.footprint_under(store.fwd_packed(0));
        let fp_r = reconstructed.footprint_under(store.fwd_packed(0));
        assert_eq!(fp_q, fp_r);
    }

    #[test]
    fn test_lookup_miss_is_definitive() {
        let mut store = build_store(504);
        add_signature_tree(&mut store, "ab&");

        let cfg = Config::default();
        let mut query = TinyTree::new(&cfg);
        query.decode_safe("ab^").unwrap();
        assert!(store.lookup_imprint_associative(&query).is_none());
    }

    #[test]
    fn test_duplicate_class_collapses_to_existing_sid() {
        let mut store = build_store(504);
        let sid = add_signature_tree(&mut store, "ab&");

        let cfg = Config::default();
        let mut dup = TinyTree::new(&cfg);
        dup.decode_fast("ba&");
        let found = store.add_imprint_associative(&dup, 99).unwrap();
        assert_eq!(found, sid);
    }

    #[test]
    fn test_interleave_one_stores_single_row() {
        let mut store = build_store(1);
        assert_eq!(store.interleave_step, MAX_TRANSFORM);
        let sid = add_signature_tree(&mut store, "ab&");
        assert_eq!(store.num_imprint(), 2); // sentinel + one row

        let cfg = Config::default();
        let mut query = TinyTree::new(&cfg);
        query.decode_fast("ba&");
        let (found, _tid) = store.lookup_imprint_associative(&query).unwrap();
        assert_eq!(found, sid);
    }

    #[test]
    fn test_rebuild_after_interleave_change_finds_same_classes() {
        let cfg = Config::default();
        let mut store = build_store(120);
        let sid_and = add_signature_tree(&mut store, "ab&");
        let sid_xor = add_signature_tree(&mut store, "ab^c^");

        // Switch presets and rebuild from the signature table.
        store.interleave = 504;
        store.interleave_step = 720;
        store.rebuild_imprints(&cfg, false, 0, 0, false).unwrap();

        let mut query = TinyTree::new(&cfg);
        query.decode_safe("bc^a^").unwrap();
        let (found, _) = store.lookup_imprint_associative(&query).unwrap();
        assert_eq!(found, sid_xor);

        query.decode_safe("ba&").unwrap();
        let (found, _) = store.lookup_imprint_associative(&query).unwrap();
        assert_eq!(found, sid_and);
    }
}
