// SPDX-License-Identifier: Apache-2.0

//! Hint collection: measure how many imprints each signature actually
//! produces at every interleave preset.
//!
//! Imprint metrics are non-linear — skin symmetries collapse rows — so the
//! counts are measured, not predicted. The resulting per-signature vectors
//! are deduplicated through the hint index and drive the hint-ordered
//! imprint rebuild, which indexes small groups first.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::INTERLEAVE_METRICS;
use crate::store::{Hint, Store, HINT_WIDTH};
use crate::tree::TinyTree;

/// Tally hints for the signatures in the sid window (`0` = open) and link
/// them through `signature.hint_id`. Returns the number of signatures
/// processed.
pub fn tally_hints(store: &mut Store, cfg: &Config, sid_lo: u32, sid_hi: u32) -> Result<u32> {
    let mut tree = TinyTree::new(cfg);
    let mut processed = 0u32;

    log::info!(
        "tallying hints for sids {}-{}",
        if sid_lo == 0 { 1 } else { sid_lo },
        if sid_hi == 0 { store.num_signature() } else { sid_hi }
    );

    for sid in 1..store.num_signature() {
        if (sid_lo != 0 && sid < sid_lo) || (sid_hi != 0 && sid >= sid_hi) {
            continue;
        }
        if cfg.cancelled() {
            break;
        }

        let name = store.signature(sid).name_str().to_string();
        tree.decode_fast(&name);

        let hint = measure(store, &tree);
        let hid = match store.intern_hint(hint) {
            Ok(hid) => hid,
            Err(Error::CapacityExceeded { section, .. }) => {
                return Err(Error::CapacityExceeded {
                    section,
                    progress: sid as u64,
                });
            }
            Err(e) => return Err(e),
        };
        store.signature_mut(sid).hint_id = hid;
        processed += 1;
    }

    log::info!("tallied {processed} signatures, numHint={}", store.num_hint());
    Ok(processed)
}

/// Distinct row footprints per preset. Matches what an imprint add would
/// store: the row transforms are every `step`-th permutation, evaluated in
/// reverse orientation, and symmetric skins collapse.
pub fn measure(store: &Store, tree: &TinyTree) -> Hint {
    let mut hint = Hint::default();
    for (i, preset) in INTERLEAVE_METRICS.iter().enumerate() {
        let mut seen: HashSet<[u64; crate::footprint::QUADS]> = HashSet::new();
        for r in 0..preset.num_stored {
            let row = r * preset.interleave_step;
            let fp = tree.footprint_under(store.rev_packed(row));
            seen.insert(fp.0);
        }
        hint.num_stored[i] = seen.len() as u32;
    }
    hint
}

/// Write `<name> <v0> … <v15>` per hinted signature.
pub fn export_hints(store: &Store, out: &mut dyn Write) -> Result<()> {
    for sid in 1..store.num_signature() {
        let sig = store.signature(sid);
        if sig.hint_id == 0 {
            continue;
        }
        let hint = store.hint(sig.hint_id);
        write!(out, "{}", sig.name_str())?;
        for v in hint.num_stored {
            write!(out, "\t{v}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Read hints produced by [`export_hints`] back into the store, attaching
/// them to the named signatures.
pub fn import_hints(store: &mut Store, path: &Path) -> Result<u32> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut loaded = 0u32;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 1 + HINT_WIDTH {
            return Err(Error::Inconsistent(format!(
                "hint line {lineno} has {} fields, expected {}",
                fields.len(),
                1 + HINT_WIDTH
            )));
        }

        let sid = store.find_signature(fields[0]).ok_or_else(|| {
            Error::Inconsistent(format!("hint line {lineno}: unknown signature {}", fields[0]))
        })?;

        let mut hint = Hint::default();
        for (i, f) in fields[1..].iter().enumerate() {
            hint.num_stored[i] = f.parse().map_err(|_| {
                Error::Inconsistent(format!("hint line {lineno}: bad count {f}"))
            })?;
        }

        let hid = store.intern_hint(hint)?;
        store.signature_mut(sid).hint_id = hid;
        loaded += 1;
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::interleave_index;
    use crate::store::policy::{SectionPolicy, SizingOptions};
    use crate::store::{pack_name, Signature};

    fn store_with_signature(name: &str) -> (Store, u32) {
        let db = Store::new_root();
        let mut policy = SectionPolicy::new(SizingOptions {
            max_signature: 8,
            max_member: 8,
            max_pair: 8,
            max_hint: 8,
            max_imprint: 1024,
            interleave: 504,
            ..SizingOptions::default()
        });
        policy.prepare_member_collection(&db, false);
        let params = policy.size_sections(&db, 1, false).unwrap();
        let mut store = policy.populate(&params, &db, 0).unwrap();
        let sid = store
            .add_signature(Signature {
                name: pack_name(name),
                size: 1,
                ..Signature::default()
            })
            .unwrap();
        (store, sid)
    }

    #[test]
    fn test_measure_collapses_symmetric_skins() {
        let cfg = Config::default();
        let (store, _sid) = store_with_signature("ab&");
        let mut tree = TinyTree::new(&cfg);
        tree.decode_fast("ab&");
        let hint = measure(&store, &tree);

        // Preset 0 stores a single row.
        assert_eq!(hint.num_stored[0], 1);
        // "ab&" only cares which unordered pair of variables lands in its
        // two slots: 9*8/2 = 36 distinct footprints at full interleave.
        let full = interleave_index(362_880).unwrap();
        assert_eq!(hint.num_stored[full], 36);
        // Counts can never exceed the preset's stored rows.
        for (i, preset) in INTERLEAVE_METRICS.iter().enumerate() {
            assert!(hint.num_stored[i] <= preset.num_stored);
        }
    }

    #[test]
    fn test_tally_attaches_hints() {
        let cfg = Config::default();
        let (mut store, sid) = store_with_signature("ab&");
        let processed = tally_hints(&mut store, &cfg, 0, 0).unwrap();
        assert_eq!(processed, 1);
        let hid = store.signature(sid).hint_id;
        assert_ne!(hid, 0);
        assert!(store.hint(hid).num_stored[0] >= 1);
    }

    #[test]
    fn test_export_import_round_trip() {
        let cfg = Config::default();
        let (mut store, sid) = store_with_signature("ab&");
        tally_hints(&mut store, &cfg, 0, 0).unwrap();

        let mut text = Vec::new();
        export_hints(&store, &mut text).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hints.lst");
        std::fs::write(&path, &text).unwrap();

        let (mut fresh, fresh_sid) = store_with_signature("ab&");
        assert_eq!(sid, fresh_sid);
        let loaded = import_hints(&mut fresh, &path).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(
            fresh.hint(fresh.signature(fresh_sid).hint_id),
            store.hint(store.signature(sid).hint_id)
        );
    }
}
