// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios over the public API: build stores through the
//! section policy, collect members, save, reload, rebuild.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use muxdb::collector::{CollectorOptions, MemberCollector};
use muxdb::generator::{CandidateSink, Generator};
use muxdb::store::policy::{SectionPolicy, SizingOptions};
use muxdb::store::Store;
use muxdb::tree::{name_counts, TinyTree};
use muxdb::{Config, IBIT, KSTART, NSTART};

fn build_store(interleave: u32, max_member: u32, max_signature: u32) -> Store {
    let db = Store::new_root();
    let mut policy = SectionPolicy::new(SizingOptions {
        max_signature,
        max_member,
        max_pair: 4 * max_member.max(16),
        max_hint: 64,
        max_imprint: max_signature * interleave + 1,
        interleave,
        ..SizingOptions::default()
    });
    policy.prepare_member_collection(&db, false);
    let params = policy.size_sections(&db, 1, false).unwrap();
    policy.populate(&params, &db, 0).unwrap()
}

fn ainf() -> Config {
    Config {
        add_if_not_found: true,
        ..Config::default()
    }
}

fn insert(c: &mut MemberCollector, cfg: &Config, name: &str) -> bool {
    let mut tree = TinyTree::new(cfg);
    tree.decode_safe(name).unwrap();
    let (canonical, _skin) = tree.encode_with_skin(tree.root);
    tree.decode_fast(&canonical);
    let (nph, nep, nbr) = name_counts(&canonical);
    c.on_candidate(&tree, &canonical, nph, nep, nbr).unwrap()
}

#[test]
fn scenario_empty_database_accepts_reserved_entries() {
    let cfg = ainf();
    let mut store = build_store(504, 64, 64);
    let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

    insert(&mut c, &cfg, "0");
    insert(&mut c, &cfg, "a");
    c.finalise().unwrap();
    c.validate_groups().unwrap();

    assert_eq!(store.num_signature() - 1, 2);
    assert_eq!(store.num_member() - 1, 2);
    for sid in 1..store.num_signature() {
        let sig = store.signature(sid);
        assert!(sig.is_safe());
        let first = sig.first_member;
        assert!(store.member(first).is_safe());
        assert_eq!(store.member(first).next_member, 0);
    }
}

#[test]
fn scenario_and_canonicalisation_collapses() {
    let cfg = ainf();
    let mut store = build_store(504, 64, 64);
    let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

    insert(&mut c, &cfg, "0");
    insert(&mut c, &cfg, "a");
    let sigs_before = c.store.num_signature();
    let members_before = c.store.num_member();

    insert(&mut c, &cfg, "ab&");
    insert(&mut c, &cfg, "ba&");

    // One new signature, one new member; "ba&" collapsed into "ab&".
    assert_eq!(c.store.num_signature(), sigs_before + 1);
    assert_eq!(c.store.num_member(), members_before + 1);
    assert_eq!(c.skip_duplicate, 1);

    // The collapse is a permutation fact too: the swapped orientation
    // resolves to the same class under the a<->b transform.
    let mut swapped = TinyTree::new(&cfg);
    swapped.decode_fast("ba&");
    let (sid, tid) = c.store.lookup_imprint_associative(&swapped).unwrap();
    assert_eq!(sid, c.store.find_signature("ab&").unwrap());
    // "ba&" IS "ab&" after ordering, so the canonical orientation hits.
    assert_eq!(tid, 0);
}

#[test]
fn scenario_xor_under_rotation() {
    let cfg = ainf();
    let mut store = build_store(504, 64, 64);
    let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

    for name in ["0", "a", "ab^", "ab^c^"] {
        insert(&mut c, &cfg, name);
    }
    let stored_sid = c.store.find_signature("abc^^").unwrap();

    let mut query = TinyTree::new(&cfg);
    query.decode_safe("bc^a^").unwrap();
    let (sid, tid) = store.lookup_imprint_associative(&query).unwrap();
    assert_eq!(sid, stored_sid);

    // Decoding the stored name under the reported transform reproduces
    // the query's truth table exactly.
    let mut reconstructed = TinyTree::new(&cfg);
    reconstructed.decode_fast_with_skin(store.signature(sid).name_str(), store.fwd_name(tid));
    assert_eq!(
        reconstructed.footprint_under(store.fwd_packed(0)),
        query.footprint_under(store.fwd_packed(0))
    );
}

#[test]
fn scenario_safe_supersedes_unsafe() {
    let cfg = ainf();
    let mut store = build_store(504, 64, 64);
    let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);

    for name in ["0", "a", "ab&", "ab+"] {
        insert(&mut c, &cfg, name);
    }

    // (a&b)|(a&c): tails resolve, but its heads have no members yet, so
    // it lands unsafe.
    insert(&mut c, &cfg, "ab&ac&+");
    let sid = c.store.find_signature("ab&ac&+").unwrap();
    assert!(!c.store.signature(sid).is_safe());

    // a&(b|c) is the same class and fully resolvable: the unsafe member
    // is flushed and the group promotes.
    insert(&mut c, &cfg, "abc+&");

    assert!(c.store.signature(sid).is_safe());
    let first = c.store.signature(sid).first_member;
    let member = c.store.member(first);
    assert!(member.is_safe());
    assert_eq!(member.name_str(), "abc+&");
    // Single member: the unsafe one was orphaned when the group flushed.
    assert_eq!(member.next_member, 0);

    c.finalise().unwrap();
    c.validate_groups().unwrap();
}

struct NameSink {
    names: Vec<String>,
}

impl CandidateSink for NameSink {
    fn on_candidate(
        &mut self,
        _tree: &TinyTree,
        name: &str,
        _nph: u32,
        _nep: u32,
        _nbr: u32,
    ) -> muxdb::error::Result<bool> {
        self.names.push(name.to_string());
        Ok(true)
    }
}

#[test]
fn scenario_truncation_stops_cleanly_and_saves() {
    let cfg = ainf();

    // Materialise a large candidate stream first.
    let mut names = NameSink { names: Vec::new() };
    let mut gen = Generator::new();
    gen.generate(&cfg, 0, &mut names).unwrap();
    gen.generate(&cfg, 1, &mut names).unwrap();
    gen.generate(&cfg, 2, &mut names).unwrap();
    assert!(names.names.len() >= 100, "expected a large candidate stream");

    // Room for 10 members; feed 100 candidates.
    let mut store = build_store(504, 10, 256);
    let opts = CollectorOptions {
        truncate: true,
        ..CollectorOptions::default()
    };
    let mut c = MemberCollector::new(&cfg, &mut store, opts, None);
    for name in names.names.iter().take(100) {
        if !insert(&mut c, &cfg, name) {
            break;
        }
    }

    let truncated = c.truncated.clone().expect("run should have truncated");
    assert!(truncated.progress > 0);

    c.finalise().unwrap();
    let summary = c.summary(2);
    let json = serde_json::to_string(&summary).unwrap();
    assert!(json.contains("\"truncated\""));

    assert!(store.num_member() <= 10);

    // The truncated output still loads cleanly.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.db");
    store.save(&path, true).unwrap();
    let reloaded = Store::open(&path).unwrap();
    assert_eq!(reloaded.num_member(), store.num_member());
    assert_eq!(reloaded.num_signature(), store.num_signature());
    assert_eq!(reloaded.find_signature("ab&"), store.find_signature("ab&"));
}

/// A random normalised tree of one or two nodes over arbitrary endpoints.
fn random_tree(rng: &mut StdRng, cfg: &Config) -> TinyTree {
    loop {
        let mut tree = TinyTree::new(cfg);
        let endpoints: Vec<u32> = (0..9).map(|k| KSTART + k).collect();
        let pick = |rng: &mut StdRng, extra: Option<u32>| -> u32 {
            let i = rng.gen_range(0..endpoints.len() + extra.map_or(0, |_| 1) + 1);
            if i == 0 {
                0
            } else if i <= endpoints.len() {
                endpoints[i - 1]
            } else {
                extra.unwrap()
            }
        };

        let q = pick(rng, None);
        let t = pick(rng, None) ^ if rng.gen() { IBIT } else { 0 };
        let f = pick(rng, None);
        let n1 = tree.normalise(q, t, f);
        if n1 & !IBIT < NSTART {
            continue;
        }

        if rng.gen() {
            // Classes are represented with non-inverted roots.
            tree.root = n1 & !IBIT;
            return tree;
        }

        let base = n1 & !IBIT;
        let q = pick(rng, Some(base));
        let t = pick(rng, Some(base)) ^ if rng.gen() { IBIT } else { 0 };
        let f = pick(rng, Some(base));
        // The second node must consume the first.
        if q != base && t & !IBIT != base && f != base {
            continue;
        }
        let n2 = tree.normalise(q, t, f);
        if n2 & !IBIT < NSTART || n2 & !IBIT == base {
            continue;
        }
        tree.root = n2 & !IBIT;
        return tree;
    }
}

#[test]
fn scenario_interleave_round_trip() {
    let cfg = ainf();

    // Build the knowledge base at interleave 120 with every class of up
    // to two nodes.
    let mut store = build_store(120, 4096, 512);
    {
        let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);
        let mut gen = Generator::new();
        gen.generate(&cfg, 0, &mut c).unwrap();
        gen.generate(&cfg, 1, &mut c).unwrap();
        gen.generate(&cfg, 2, &mut c).unwrap();
        c.finalise().unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kb-i120.db");
    store.save(&path, true).unwrap();

    // Reopen and rebuild the imprints at interleave 504.
    let db = Store::open(&path).unwrap();
    assert_eq!(db.interleave, 120);
    let mut policy = SectionPolicy::new(SizingOptions {
        interleave: 504,
        max_signature: db.num_signature(),
        max_member: db.num_member(),
        max_pair: db.num_pair().max(16),
        max_hint: 64,
        max_imprint: db.num_signature() * 504 + 1,
        ..SizingOptions::default()
    });
    policy.prepare_member_collection(&db, false);
    let params = policy.size_sections(&db, 2, false).unwrap();
    let mut rebuilt = policy.populate(&params, &db, 0).unwrap();
    *rebuilt.signatures.owned_mut() = db.signatures.as_slice().to_vec();
    rebuilt.rebuild_imprints(&cfg, false, 0, 0, false).unwrap();
    rebuilt.rebuild_indices(policy.rebuild);

    // Both stores identify the same signature for random queries.
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut hits = 0u32;
    for _ in 0..1000 {
        let tree = random_tree(&mut rng, &cfg);
        let before = store.lookup_imprint_associative(&tree);
        let after = rebuilt.lookup_imprint_associative(&tree);
        let (sid_before, _tid_b) = before.expect("class must be known at interleave 120");
        let (sid_after, _tid_a) = after.expect("class must be known at interleave 504");
        assert_eq!(sid_before, sid_after);
        hits += 1;
    }
    assert_eq!(hits, 1000);
}

#[test]
fn scenario_save_reload_is_fixed_point() {
    let cfg = ainf();
    let mut store = build_store(504, 64, 64);
    {
        let mut c = MemberCollector::new(&cfg, &mut store, CollectorOptions::default(), None);
        for name in ["0", "a", "ab&", "ab+", "ab^"] {
            insert(&mut c, &cfg, name);
        }
        c.finalise().unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("kb.db");
    store.save(&first, true).unwrap();

    let reloaded = Store::open(&first).unwrap();
    let second = dir.path().join("kb2.db");
    reloaded.save(&second, true).unwrap();

    let a = std::fs::read(&first).unwrap();
    let b = std::fs::read(&second).unwrap();
    // Identical apart from the creation stamp at its fixed offset.
    let stamp = 23 * 4..23 * 4 + 32;
    assert_eq!(a[..stamp.start], b[..stamp.start]);
    assert_eq!(a[stamp.end..], b[stamp.end..]);
}
