// SPDX-License-Identifier: Apache-2.0

//! Collect signature group members.
//!
//! Candidates come from the bounded generator and/or a text file; each is
//! matched against the imprint index, screened by the safe-promotion
//! rules, and the surviving set is compacted, sorted and written out as a
//! new database.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context};
use clap::Parser;

use muxdb::collector::{CollectorOptions, MemberCollector, TextMode};
use muxdb::generator::{read_candidate_file, Generator};
use muxdb::prime::next_prime;
use muxdb::store::policy::{assert_rebuildable, SectionPolicy, SizingOptions};
use muxdb::store::{flags, mask, Store};
use muxdb::{Config, ScoreMode};

#[derive(Debug, Parser)]
#[command(name = "gen-member-db")]
#[command(about = "Collect signature group members into a muxdb database")]
struct Args {
    /// Input database.
    input_db: PathBuf,

    /// Tree size in nodes to generate for this invocation.
    num_nodes: u32,

    /// Output database.
    output_db: Option<PathBuf>,

    /// Overwrite the output database if it already exists.
    #[arg(long)]
    force: bool,

    /// Skip the generator; only load candidates from a file.
    #[arg(long = "no-generate")]
    no_generate: bool,

    /// Read candidates from a file as well.
    #[arg(long)]
    load: Option<PathBuf>,

    /// Imprint index interleave.
    #[arg(long)]
    interleave: Option<u32>,

    /// Index/data size ratio.
    #[arg(long)]
    ratio: Option<f64>,

    #[arg(long, default_value_t = 0)]
    maxsignature: u32,
    #[arg(long, default_value_t = 0)]
    maximprint: u32,
    #[arg(long, default_value_t = 0)]
    maxmember: u32,
    #[arg(long, default_value_t = 0)]
    maxpair: u32,
    #[arg(long, default_value_t = 0)]
    maxhint: u32,

    /// Index sizes; silently rounded up to the next prime.
    #[arg(long, default_value_t = 0)]
    signatureindexsize: u32,
    #[arg(long, default_value_t = 0)]
    imprintindexsize: u32,
    #[arg(long, default_value_t = 0)]
    memberindexsize: u32,
    #[arg(long, default_value_t = 0)]
    hintindexsize: u32,
    #[arg(long, default_value_t = 0)]
    pairindexsize: u32,

    /// Sid range for imprint rebuilds: `[lo,]hi`.
    #[arg(long)]
    sid: Option<String>,

    /// Generator window: `[lo,]hi`.
    #[arg(long)]
    window: Option<String>,

    /// Task slicing: `id,last` or `sge`.
    #[arg(long)]
    task: Option<String>,

    /// QTF->QnTF rewriting.
    #[arg(long)]
    pure: bool,

    /// Enable the expensive assertions.
    #[arg(long)]
    paranoid: bool,

    /// Create signatures for unmatched candidates.
    #[arg(long)]
    ainf: bool,

    /// Rebuild imprints for empty/unsafe signature groups only.
    #[arg(long = "unsafe")]
    unsafe_rebuild: bool,

    /// Truncate on database overflow instead of failing.
    #[arg(long)]
    truncate: bool,

    /// Rank members lexicographically instead of by node count.
    #[arg(long)]
    lexscore: bool,

    /// Textual output: won, compare, brief, verbose or sql (or 1-5).
    #[arg(long)]
    text: Option<String>,

    /// Save without the level-1 indices and imprints.
    #[arg(long = "no-saveindex")]
    no_saveindex: bool,
}

fn parse_range(s: &str) -> anyhow::Result<(u64, u64)> {
    match s.split_once(',') {
        Some((lo, hi)) => Ok((lo.trim().parse()?, hi.trim().parse()?)),
        None => Ok((0, s.trim().parse()?)),
    }
}

fn parse_text(s: &str) -> anyhow::Result<TextMode> {
    Ok(match s {
        "1" | "won" => TextMode::Won,
        "2" | "compare" => TextMode::Compare,
        "3" | "brief" => TextMode::Brief,
        "4" | "verbose" => TextMode::Verbose,
        "5" | "sql" => TextMode::Sql,
        other => bail!("unknown --text mode: {other}"),
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let text = match args.text.as_deref() {
        Some(s) => parse_text(s)?,
        None => TextMode::None,
    };

    // Without an output database only the streaming text modes leave the
    // store untouched.
    let read_only =
        args.output_db.is_none() && text != TextMode::Brief && text != TextMode::Verbose
            && text != TextMode::Sql;

    if let Some(out) = &args.output_db {
        if out.exists() && !args.force {
            bail!("{} already exists. Use --force to overwrite", out.display());
        }
    }
    if let Some(load) = &args.load {
        if !load.exists() {
            bail!("{} does not exist", load.display());
        }
    }

    let cfg = Config {
        pure: args.pure,
        paranoid: args.paranoid,
        add_if_not_found: args.ainf,
        score_mode: if args.lexscore {
            ScoreMode::Lexicographic
        } else {
            ScoreMode::Nodes
        },
        ..Config::default()
    };

    // Signal handling stays out of the engine: flip the shared flag and
    // let the run wind down at the next candidate boundary.
    let cancel = cfg.cancel.clone();
    ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed))
        .context("installing signal handler")?;

    let db = Store::open(&args.input_db)
        .with_context(|| format!("opening {}", args.input_db.display()))?;

    let mut creation_flags = 0;
    if args.pure {
        creation_flags |= flags::PURE;
    }
    if args.paranoid {
        creation_flags |= flags::PARANOID;
    }
    if args.ainf {
        creation_flags |= flags::ADD_IF_NOT_FOUND;
    }
    if db.creation_flags != creation_flags {
        log::warn!(
            "database/system flags differ: database={:#x} current={:#x}",
            db.creation_flags,
            creation_flags
        );
    }

    let mut opts = SizingOptions {
        max_signature: args.maxsignature,
        max_imprint: args.maximprint,
        max_member: args.maxmember,
        max_pair: args.maxpair,
        max_hint: args.maxhint,
        signature_index_size: round_prime(args.signatureindexsize),
        imprint_index_size: round_prime(args.imprintindexsize),
        member_index_size: round_prime(args.memberindexsize),
        hint_index_size: round_prime(args.hintindexsize),
        pair_index_size: round_prime(args.pairindexsize),
        interleave: args.interleave.unwrap_or(0),
        ..SizingOptions::default()
    };
    if let Some(r) = args.ratio {
        opts.ratio = r;
    }
    // Signatures are fixed for the address space unless the run may create
    // them.
    if !read_only && !args.ainf && opts.max_signature == 0 {
        opts.max_signature = db.num_signature();
    }

    let mut policy = SectionPolicy::new(opts);
    policy.read_only = read_only;
    policy.prepare_member_collection(&db, args.unsafe_rebuild);

    // The input database always carries at least the 4-node address space.
    let size_nodes = args.num_nodes.max(4);
    let params = policy.size_sections(&db, size_nodes, args.pure)?;
    log::info!(
        "allocating ~{:.3} GB for the output store",
        params.estimate_bytes() as f64 / 1e9
    );
    let mut store = policy.populate(&params, &db, creation_flags)?;
    log::debug!("{}", serde_json::to_string(&db.info())?);

    assert_rebuildable(policy.rebuild & !(mask::SIGNATURE | mask::IMPRINT))
        .map_err(anyhow::Error::from)?;

    // Rebuilds in dependency order: signatures, imprints, name indices.
    if policy.rebuild & mask::SIGNATURE != 0 {
        *store.signatures.owned_mut() = db.signatures.as_slice().to_vec();
    }
    let (sid_lo, sid_hi) = match args.sid.as_deref() {
        Some(s) => {
            let (lo, hi) = parse_range(s)?;
            (lo as u32, hi as u32)
        }
        None => (0, 0),
    };
    let mut rebuild = policy.rebuild;
    if rebuild & mask::IMPRINT != 0 {
        if !args.unsafe_rebuild {
            store.rebuild_imprints(&cfg, false, sid_lo, sid_hi, args.truncate)?;
        } else if store.num_hint() > 1 {
            store.rebuild_imprints_with_hints(&cfg, args.truncate)?;
        } else {
            store.rebuild_imprints(&cfg, true, sid_lo, sid_hi, args.truncate)?;
        }
        rebuild &= !(mask::IMPRINT | mask::IMPRINT_INDEX);
    }
    store.rebuild_indices(rebuild & !mask::SIGNATURE);

    log::info!(
        "numImprint={} numMember={}",
        store.num_imprint(),
        store.num_member()
    );

    /*
     * Collect candidates.
     */

    let mut generator = Generator::new();
    match args.task.as_deref() {
        Some("sge") => {
            let id: u32 = std::env::var("SGE_TASK_ID")
                .context("missing environment SGE_TASK_ID")?
                .parse()?;
            let last: u32 = std::env::var("SGE_TASK_LAST")
                .context("missing environment SGE_TASK_LAST")?
                .parse()?;
            if id < 1 || id > last {
                bail!("sge id/last out of bounds: {id},{last}");
            }
            generator.apply_task(id, last, args.pure, args.num_nodes)?;
        }
        Some(task) => {
            let (id, last) = parse_range(task)?;
            if id == 0 || last == 0 || id > last {
                bail!("bad --task: {task}");
            }
            generator.apply_task(id as u32, last as u32, args.pure, args.num_nodes)?;
        }
        None => {}
    }
    if let Some(window) = args.window.as_deref() {
        let (lo, hi) = parse_range(window)?;
        generator.window_lo = lo;
        generator.window_hi = hi;
        if hi != 0 && lo >= hi {
            bail!("--window low exceeds high");
        }
    }

    let mut stdout = std::io::stdout();
    let copts = CollectorOptions {
        read_only,
        truncate: args.truncate,
        text,
    };
    let mut collector = MemberCollector::new(&cfg, &mut store, copts, Some(&mut stdout));

    if let Some(load) = &args.load {
        log::info!("reading members from {}", load.display());
        if let Err(e) =
            read_candidate_file(&cfg, load, generator.window_lo, generator.window_hi, &mut collector)
        {
            eprintln!("{}", e.to_json());
            return Err(e.into());
        }
    }
    if !args.no_generate {
        if args.num_nodes == 1 {
            // Also seed the reserved "0" and "a" entries; the window only
            // applies to the main run.
            Generator::new().generate(&cfg, 0, &mut collector)?;
        }
        generator.generate(&cfg, args.num_nodes, &mut collector)?;
    }

    if let Some(t) = &collector.truncated {
        log::warn!(
            "storage full, truncating at progress={} \"{}\"",
            t.progress,
            t.name
        );
    }

    if !read_only {
        collector.finalise()?;
        collector.validate_groups()?;
        collector.write_text()?;
    }
    if args.paranoid {
        collector.store.validate()?;
    }

    let summary = collector.summary(args.num_nodes);
    drop(collector);

    if let Some(out) = &args.output_db {
        if let Err(e) = store.save(out, !args.no_saveindex) {
            // Never leave a half-written database behind.
            let _ = std::fs::remove_file(out);
            return Err(e.into());
        }
    }

    eprintln!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn round_prime(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        next_prime(n as u64) as u32
    }
}
