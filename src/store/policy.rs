// SPDX-License-Identifier: Apache-2.0

//! Section sizing and the inherit/copy-on-write/rebuild decisions that
//! keep a read-only input store and a writable output store consistent.
//!
//! Workflow per build step:
//! - size output sections from command-line overrides, else inherit, else
//!   the metrics presets (with a safety margin), else pass through;
//! - any change to hashing properties (index size, interleave) invalidates
//!   an index and forces a rebuild;
//! - sections that fit and whose parameters are unchanged are inherited
//!   (shared read-only) under copy-on-write, otherwise copied;
//! - every index needs one slot more than its data; every data section
//!   keeps the reserved sentinel entry; a rebuilt section is never
//!   inherited.

use crate::error::{Error, Result};
use crate::metrics;
use crate::prime::next_prime;
use crate::store::section::mask;
use crate::store::{SectionView, Store};
use crate::{MAX_TRANSFORM, SLOT_COUNT};

/// Output capacities decided by [`SectionPolicy::size_sections`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreParams {
    pub interleave: u32,
    pub interleave_step: u32,
    pub max_signature: u32,
    pub signature_index_size: u32,
    pub max_hint: u32,
    pub hint_index_size: u32,
    pub max_imprint: u32,
    pub imprint_index_size: u32,
    pub max_member: u32,
    pub member_index_size: u32,
    pub max_pair: u32,
    pub pair_index_size: u32,
}

impl StoreParams {
    /// Rough resident size of a store allocated to these capacities, for
    /// the pre-allocation warning. Inherited sections are shared and cost
    /// nothing; this assumes the worst case of private copies everywhere.
    pub fn estimate_bytes(&self) -> u64 {
        const SIG_BYTES: u64 = 48;
        const HINT_BYTES: u64 = 64;
        const IMPRINT_BYTES: u64 = 72;
        const MEMBER_BYTES: u64 = 136;
        const PAIR_BYTES: u64 = 8;
        const INDEX_BYTES: u64 = 4;

        self.max_signature as u64 * SIG_BYTES
            + self.signature_index_size as u64 * INDEX_BYTES
            + self.max_hint as u64 * HINT_BYTES
            + self.hint_index_size as u64 * INDEX_BYTES
            + self.max_imprint as u64 * IMPRINT_BYTES
            + self.imprint_index_size as u64 * INDEX_BYTES
            + self.max_member as u64 * MEMBER_BYTES
            + self.member_index_size as u64 * INDEX_BYTES
            + self.max_pair as u64 * PAIR_BYTES
            + self.pair_index_size as u64 * INDEX_BYTES
    }
}

/// User overrides; zero means "decide automatically".
#[derive(Debug, Clone)]
pub struct SizingOptions {
    pub max_signature: u32,
    pub max_hint: u32,
    pub max_imprint: u32,
    pub max_member: u32,
    pub max_pair: u32,
    pub signature_index_size: u32,
    pub hint_index_size: u32,
    pub imprint_index_size: u32,
    pub member_index_size: u32,
    pub pair_index_size: u32,
    pub interleave: u32,
    pub ratio: f64,
}

impl Default for SizingOptions {
    fn default() -> Self {
        SizingOptions {
            max_signature: 0,
            max_hint: 0,
            max_imprint: 0,
            max_member: 0,
            max_pair: 0,
            signature_index_size: 0,
            hint_index_size: 0,
            imprint_index_size: 0,
            member_index_size: 0,
            pair_index_size: 0,
            interleave: 0,
            ratio: metrics::DEFAULT_RATIO,
        }
    }
}

pub struct SectionPolicy {
    pub opts: SizingOptions,
    /// Input may be shared read-only with the output.
    pub copy_on_write: bool,
    /// No changes will be made to the database.
    pub read_only: bool,
    /// Sections shared with the input image.
    pub inherit: u32,
    /// Allocated sections that need rebuilding.
    pub rebuild: u32,
}

impl SectionPolicy {
    pub fn new(opts: SizingOptions) -> Self {
        SectionPolicy {
            opts,
            copy_on_write: false,
            read_only: false,
            inherit: mask::ALL,
            rebuild: 0,
        }
    }

    fn raise_percent(n: u64, percent: u64) -> u32 {
        let raised = n + n * percent / 100;
        raised.min(u32::MAX as u64 - 1) as u32
    }

    /// Data-section capacity by the standard priority list.
    fn size_data(
        &mut self,
        bit: u32,
        user: u32,
        db_num: u32,
        metric: impl Fn() -> Result<u64>,
    ) -> Result<u32> {
        let max = if user != 0 {
            user
        } else if self.inherit & bit != 0 {
            db_num
        } else if !self.read_only {
            Self::raise_percent(metric()?, 5)
        } else if db_num != 0 {
            db_num
        } else {
            1
        };

        if max > db_num {
            // Growing sections cannot share the input backing.
            self.inherit &= !bit;
        } else if self.copy_on_write {
            self.inherit |= bit;
        }
        Ok(max)
    }

    /// Index capacity: zero without data, else the priority list with the
    /// metrics step replaced by prime(data × ratio).
    fn size_index(&mut self, bit: u32, data_max: u32, user: u32, db_size: u32) -> u32 {
        if data_max == 0 {
            return 0;
        }
        let size = if user != 0 {
            user
        } else if self.inherit & bit != 0 {
            db_size
        } else if !self.read_only {
            next_prime((data_max as f64 * self.opts.ratio) as u64) as u32
        } else if db_size != 0 {
            db_size
        } else {
            1
        };

        if size != db_size {
            // Hashing parameters changed: the input index is unusable.
            self.rebuild |= bit;
            self.inherit &= !self.rebuild;
        } else if self.copy_on_write {
            self.inherit |= bit;
        }
        size
    }

    /// Decide output capacities for every section.
    pub fn size_sections(
        &mut self,
        db: &Store,
        num_nodes: u32,
        pure: bool,
    ) -> Result<StoreParams> {
        self.inherit &= !self.rebuild;

        let mut p = StoreParams::default();

        // signature
        p.max_signature = self.size_data(
            mask::SIGNATURE,
            self.opts.max_signature,
            db.num_signature(),
            || Ok(metrics::generator_metrics(SLOT_COUNT as u32, pure, num_nodes)?.num_signature),
        )?;
        p.signature_index_size = self.size_index(
            mask::SIGNATURE_INDEX,
            p.max_signature,
            self.opts.signature_index_size,
            db.signature_index_size,
        );

        // hint
        p.max_hint = self.size_data(mask::HINT, self.opts.max_hint, db.num_hint(), || {
            Ok(metrics::generator_metrics(SLOT_COUNT as u32, pure, num_nodes)?.num_hint)
        })?;
        p.hint_index_size = self.size_index(
            mask::HINT_INDEX,
            p.max_hint,
            self.opts.hint_index_size,
            db.hint_index_size,
        );

        // interleave is a setting, not a section, but changing it
        // invalidates the imprints.
        p.interleave = if self.opts.interleave != 0 {
            self.opts.interleave
        } else if db.interleave != 0 {
            db.interleave
        } else {
            metrics::DEFAULT_INTERLEAVE
        };
        let im = metrics::interleave_metrics(SLOT_COUNT as u32, p.interleave).ok_or(
            Error::MissingPreset {
                slots: SLOT_COUNT as u32,
                pure,
                nodes: num_nodes,
            },
        )?;
        p.interleave = im.num_stored;
        p.interleave_step = im.interleave_step;
        if p.interleave != db.interleave {
            // The imprint data and its index are regenerated together; an
            // interleave change invalidates both.
            self.rebuild |= mask::IMPRINT | mask::IMPRINT_INDEX;
            self.inherit &= !self.rebuild;
        }

        // imprint
        if p.max_signature == 0 {
            p.interleave = 0;
            p.interleave_step = 0;
            p.max_imprint = 0;
        } else {
            if self.opts.max_imprint != 0 {
                p.max_imprint = self.opts.max_imprint;
            } else if self.inherit & mask::IMPRINT != 0 {
                p.max_imprint = db.num_imprint();
            } else if !self.read_only {
                p.max_imprint = Self::raise_percent(
                    metrics::imprint_estimate(SLOT_COUNT as u32, pure, p.interleave, num_nodes)?,
                    5,
                );
            } else if db.num_imprint() != 0 {
                p.max_imprint = db.num_imprint();
            } else {
                p.interleave = 1;
                p.interleave_step = MAX_TRANSFORM;
                p.max_imprint = 1;
            }

            // imprint as data
            if p.max_imprint > db.num_imprint() {
                self.inherit &= !mask::IMPRINT;
            } else if self.copy_on_write {
                self.inherit |= mask::IMPRINT;
            }

            // imprint as an index over signatures
            if db.num_imprint() == 0 || p.interleave != db.interleave {
                self.rebuild |= mask::IMPRINT | mask::IMPRINT_INDEX;
                self.inherit &= !self.rebuild;
            } else if self.copy_on_write {
                self.inherit |= mask::IMPRINT;
            }
        }
        p.imprint_index_size = self.size_index(
            mask::IMPRINT_INDEX,
            p.max_imprint,
            self.opts.imprint_index_size,
            db.imprint_index_size,
        );

        // member
        p.max_member = self.size_data(mask::MEMBER, self.opts.max_member, db.num_member(), || {
            Ok(metrics::generator_metrics(SLOT_COUNT as u32, pure, num_nodes)?.num_member)
        })?;
        p.member_index_size = self.size_index(
            mask::MEMBER_INDEX,
            p.max_member,
            self.opts.member_index_size,
            db.member_index_size,
        );

        // pair
        p.max_pair = self.size_data(mask::PAIR, self.opts.max_pair, db.num_pair(), || {
            Ok(metrics::generator_metrics(SLOT_COUNT as u32, pure, num_nodes)?.num_pair)
        })?;
        p.pair_index_size = self.size_index(
            mask::PAIR_INDEX,
            p.max_pair,
            self.opts.pair_index_size,
            db.pair_index_size,
        );

        // A rebuilt section is never inherited.
        self.inherit &= !self.rebuild;

        log::debug!(
            "store create: maxSignature={} signatureIndexSize={} maxHint={} hintIndexSize={} interleave={} maxImprint={} imprintIndexSize={} maxMember={} memberIndexSize={} maxPair={} pairIndexSize={}",
            p.max_signature, p.signature_index_size, p.max_hint, p.hint_index_size,
            p.interleave, p.max_imprint, p.imprint_index_size,
            p.max_member, p.member_index_size, p.max_pair, p.pair_index_size
        );

        // Output data must be large enough to fit input data.
        if p.max_signature < db.num_signature() {
            return Err(Error::Inconsistent(format!(
                "maxsignature={} needs to be at least {}",
                p.max_signature,
                db.num_signature()
            )));
        }
        if p.max_hint < db.num_hint() {
            return Err(Error::Inconsistent(format!(
                "maxhint={} needs to be at least {}",
                p.max_hint,
                db.num_hint()
            )));
        }
        if p.max_member < db.num_member() {
            return Err(Error::Inconsistent(format!(
                "maxmember={} needs to be at least {}",
                p.max_member,
                db.num_member()
            )));
        }

        Ok(p)
    }

    /// Enact the decisions: inherit borrows the input backing, rebuild
    /// allocates empty and defers filling, anything else copies.
    ///
    /// The caller then performs rebuilds in dependency order: signatures →
    /// imprints → member index. Data sections (transforms, members) are
    /// never rebuilt here — only inherited or copied.
    pub fn populate(&self, params: &StoreParams, db: &Store, creation_flags: u32) -> Result<Store> {
        log::debug!(
            "copyOnWrite={} inheritSections=[{}] rebuildSections=[{}]",
            self.copy_on_write,
            mask::to_text(self.inherit),
            mask::to_text(self.rebuild)
        );

        // Transforms are never invalid or resized.
        if !db.has_transforms() {
            return Err(Error::Inconsistent(
                "input database is missing the transform section".to_string(),
            ));
        }

        fn data<T: Clone + Default>(
            policy: &SectionPolicy,
            bit: u32,
            input: &SectionView<T>,
            out_max: u32,
        ) -> SectionView<T> {
            if out_max == 0 {
                return SectionView::empty();
            }
            if policy.inherit & bit != 0 {
                input.share()
            } else if input.is_empty() {
                SectionView::Owned(vec![T::default()])
            } else if out_max as usize <= input.len() && policy.copy_on_write {
                input.share()
            } else if policy.rebuild & bit == 0 {
                log::debug!("copying section [{}]", mask::to_text(bit));
                input.to_owned_copy()
            } else {
                SectionView::Owned(vec![T::default()])
            }
        }

        fn index(
            policy: &SectionPolicy,
            bit: u32,
            input: &SectionView<u32>,
            out_size: u32,
        ) -> SectionView<u32> {
            if out_size == 0 {
                return SectionView::empty();
            }
            if policy.inherit & bit != 0 {
                input.share()
            } else if policy.rebuild & bit != 0 {
                SectionView::Owned(vec![0; out_size as usize])
            } else if input.is_empty() {
                SectionView::Owned(vec![0; out_size as usize])
            } else if policy.copy_on_write {
                debug_assert_eq!(out_size as usize, input.len());
                input.share()
            } else {
                debug_assert_eq!(out_size as usize, input.len());
                input.to_owned_copy()
            }
        }

        let store = Store {
            creation_flags,
            interleave: params.interleave,
            interleave_step: params.interleave_step,

            fwd_transforms: db.fwd_transforms.share(),
            rev_transforms: db.rev_transforms.share(),
            fwd_transform_names: db.fwd_transform_names.share(),
            rev_transform_names: db.rev_transform_names.share(),
            rev_transform_ids: db.rev_transform_ids.share(),

            max_signature: params.max_signature,
            signatures: data(self, mask::SIGNATURE, &db.signatures, params.max_signature),
            signature_index_size: params.signature_index_size,
            signature_index: index(
                self,
                mask::SIGNATURE_INDEX,
                &db.signature_index,
                params.signature_index_size,
            ),

            max_hint: params.max_hint,
            hints: data(self, mask::HINT, &db.hints, params.max_hint),
            hint_index_size: params.hint_index_size,
            hint_index: index(self, mask::HINT_INDEX, &db.hint_index, params.hint_index_size),

            max_imprint: params.max_imprint,
            imprints: data(self, mask::IMPRINT, &db.imprints, params.max_imprint),
            imprint_index_size: params.imprint_index_size,
            imprint_index: index(
                self,
                mask::IMPRINT_INDEX,
                &db.imprint_index,
                params.imprint_index_size,
            ),

            max_member: params.max_member,
            members: data(self, mask::MEMBER, &db.members, params.max_member),
            member_index_size: params.member_index_size,
            member_index: index(
                self,
                mask::MEMBER_INDEX,
                &db.member_index,
                params.member_index_size,
            ),

            max_pair: params.max_pair,
            pairs: data(self, mask::PAIR, &db.pairs, params.max_pair),
            pair_index_size: params.pair_index_size,
            pair_index: index(self, mask::PAIR_INDEX, &db.pair_index, params.pair_index_size),
        };

        Ok(store)
    }

    /// Mask adjustments for a member-collection run, before sizing: the
    /// collector writes signatures, members and pairs (so they cannot be
    /// inherited), needs a private signature copy, and `--unsafe` forces an
    /// imprint rebuild.
    pub fn prepare_member_collection(&mut self, db: &Store, unsafe_rebuild: bool) {
        self.inherit &= !(mask::SIGNATURE
            | mask::PAIR
            | mask::PAIR_INDEX
            | mask::MEMBER
            | mask::MEMBER_INDEX);
        if db.signature_index_size == 0 {
            self.inherit &= !mask::SIGNATURE_INDEX;
        }
        if db.num_imprint() == 0 {
            self.inherit &= !mask::IMPRINT;
        }
        if db.imprint_index_size == 0 {
            self.inherit &= !mask::IMPRINT_INDEX;
        }
        if unsafe_rebuild {
            self.rebuild |= mask::IMPRINT | mask::IMPRINT_INDEX;
        }
        // The collector mutates signature records in place.
        self.rebuild |= mask::SIGNATURE;
        self.inherit &= !self.rebuild;
    }
}

/// Data sections that may legally carry a rebuild flag into
/// [`SectionPolicy::populate`]. Transforms and members cannot be rebuilt.
pub fn assert_rebuildable(rebuild: u32) -> Result<()> {
    if rebuild & (mask::TRANSFORM | mask::MEMBER | mask::HINT) != 0 {
        return Err(Error::Inconsistent(format!(
            "data sections cannot be rebuilt: [{}]",
            mask::to_text(rebuild & (mask::TRANSFORM | mask::MEMBER | mask::HINT))
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized_root(max_member: u32) -> (Store, SectionPolicy, StoreParams) {
        let db = Store::new_root();
        let mut policy = SectionPolicy::new(SizingOptions {
            max_signature: 32,
            max_member,
            max_imprint: 40_000,
            max_pair: 64,
            max_hint: 8,
            interleave: 504,
            ..SizingOptions::default()
        });
        policy.prepare_member_collection(&db, false);
        let params = policy.size_sections(&db, 1, false).unwrap();
        (db, policy, params)
    }

    #[test]
    fn test_sizing_honours_user_overrides() {
        let (_db, _policy, params) = sized_root(10);
        assert_eq!(params.max_member, 10);
        assert_eq!(params.max_signature, 32);
        assert_eq!(params.interleave, 504);
        assert_eq!(params.interleave_step, 720);
    }

    #[test]
    fn test_index_sizes_are_prime_ratio_of_data() {
        let (_db, _policy, params) = sized_root(100);
        // ratio 5.0 over max 100 rounds up to the next table prime.
        assert_eq!(
            params.member_index_size as u64,
            crate::prime::next_prime(500)
        );
    }

    #[test]
    fn test_fresh_input_forces_rebuilds() {
        let (_db, policy, _params) = sized_root(10);
        assert_ne!(policy.rebuild & mask::IMPRINT, 0);
        assert_ne!(policy.rebuild & mask::SIGNATURE, 0);
        assert_eq!(policy.inherit & policy.rebuild, 0);
    }

    #[test]
    fn test_populate_allocates_sentinels() {
        let (db, policy, params) = sized_root(10);
        let store = policy.populate(&params, &db, 0).unwrap();
        assert_eq!(store.num_member(), 1);
        assert_eq!(store.num_pair(), 1);
        assert_eq!(store.member_index.len(), params.member_index_size as usize);
        assert!(!store.members.is_inherited());
        assert!(store.fwd_transforms.is_inherited());
    }

    #[test]
    fn test_metrics_sizing_missing_preset_is_fatal() {
        let db = Store::new_root();
        let mut policy = SectionPolicy::new(SizingOptions::default());
        policy.prepare_member_collection(&db, false);
        let err = policy.size_sections(&db, 99, false).unwrap_err();
        assert!(matches!(err, Error::MissingPreset { .. }));
    }

    #[test]
    fn test_shrinking_below_input_is_inconsistent() {
        let db = Store::new_root();
        // Force a member section smaller than the input's live count by
        // first growing the input.
        let mut grown = Store::new_root();
        grown.max_member = 4;
        grown.members.owned_mut().push(crate::store::Member::default());
        grown.members.owned_mut().push(crate::store::Member::default());
        let mut policy = SectionPolicy::new(SizingOptions {
            max_member: 1,
            max_signature: 4,
            max_imprint: 600,
            max_pair: 4,
            max_hint: 4,
            interleave: 504,
            ..SizingOptions::default()
        });
        policy.prepare_member_collection(&grown, false);
        let err = policy.size_sections(&grown, 1, false).unwrap_err();
        assert!(matches!(err, Error::Inconsistent(_)));
        drop(db);
    }

    #[test]
    fn test_copy_on_write_inherits_fitting_sections() {
        let mut db = Store::new_root();
        db.interleave = 504;
        db.interleave_step = 720;
        // Give the input a populated member section.
        db.max_member = 4;
        db.members.owned_mut().push(crate::store::Member::default());
        db.member_index_size = 23;
        db.member_index = SectionView::Owned(vec![0; 23]);

        let mut policy = SectionPolicy::new(SizingOptions {
            interleave: 504,
            ..SizingOptions::default()
        });
        policy.copy_on_write = true;
        policy.read_only = true;
        let params = policy.size_sections(&db, 1, false).unwrap();
        assert_eq!(params.max_member, db.num_member());
        assert_ne!(policy.inherit & mask::MEMBER, 0);
        let store = policy.populate(&params, &db, 0).unwrap();
        assert!(store.members.is_inherited());
    }
}
