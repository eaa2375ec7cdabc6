// SPDX-License-Identifier: Apache-2.0

//! Tally interleave hints.
//!
//! Imprint metrics are non-linear and difficult to predict; this tool
//! counts how many imprints each signature actually creates at every
//! interleave preset, and stores the vectors as hint records for the
//! hint-ordered imprint rebuild.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context};
use clap::Parser;

use muxdb::hints::{export_hints, import_hints, tally_hints};
use muxdb::prime::next_prime;
use muxdb::store::policy::{SectionPolicy, SizingOptions};
use muxdb::store::{mask, Store};
use muxdb::Config;

#[derive(Debug, Parser)]
#[command(name = "gen-hint-db")]
#[command(about = "Tally per-signature imprint counts across interleave presets")]
struct Args {
    /// Input database.
    input_db: PathBuf,

    /// Output database.
    output_db: Option<PathBuf>,

    /// Overwrite the output database if it already exists.
    #[arg(long)]
    force: bool,

    /// Read hints from a file instead of measuring.
    #[arg(long)]
    load: Option<PathBuf>,

    /// Maximum number of hints.
    #[arg(long, default_value_t = 0)]
    maxhint: u32,

    /// Hint index size; silently rounded up to the next prime.
    #[arg(long, default_value_t = 0)]
    hintindexsize: u32,

    /// Index/data size ratio.
    #[arg(long)]
    ratio: Option<f64>,

    /// Sid range to tally: `[lo,]hi`.
    #[arg(long)]
    sid: Option<String>,

    /// Task slicing over the sid range: `id,last` or `sge`.
    #[arg(long)]
    task: Option<String>,

    /// Write the tallied hints as text to stdout.
    #[arg(long)]
    text: bool,

    /// Save without the level-1 indices and imprints.
    #[arg(long = "no-saveindex")]
    no_saveindex: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(out) = &args.output_db {
        if out.exists() && !args.force {
            bail!("{} already exists. Use --force to overwrite", out.display());
        }
    }

    let cfg = Config::default();
    let cancel = cfg.cancel.clone();
    ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed))
        .context("installing signal handler")?;

    let db = Store::open(&args.input_db)
        .with_context(|| format!("opening {}", args.input_db.display()))?;
    if db.num_signature() < 2 {
        bail!("input database has no signatures to tally");
    }

    let mut opts = SizingOptions {
        max_hint: args.maxhint,
        hint_index_size: if args.hintindexsize == 0 {
            0
        } else {
            next_prime(args.hintindexsize as u64) as u32
        },
        max_signature: db.num_signature(),
        interleave: db.interleave,
        ..SizingOptions::default()
    };
    if let Some(r) = args.ratio {
        opts.ratio = r;
    }
    if opts.max_hint == 0 {
        // Worst case one distinct vector per signature.
        opts.max_hint = db.num_signature();
    }
    // Tallying stages at most one full row set at a time.
    opts.max_imprint = db.num_imprint().max(muxdb::MAX_TRANSFORM);

    let mut policy = SectionPolicy::new(opts);
    // Hints and their index are written; signatures take the hint links.
    policy.inherit &= !(mask::HINT | mask::HINT_INDEX);
    policy.rebuild |= mask::SIGNATURE;
    policy.inherit &= !policy.rebuild;

    let params = policy.size_sections(&db, 4, db.creation_flags & muxdb::store::flags::PURE != 0)?;
    let mut store = policy.populate(&params, &db, db.creation_flags)?;
    *store.signatures.owned_mut() = db.signatures.as_slice().to_vec();
    store.rebuild_indices(policy.rebuild & !mask::SIGNATURE);

    // Sid window, optionally sliced into tasks.
    let (mut sid_lo, mut sid_hi) = match args.sid.as_deref() {
        Some(s) => match s.split_once(',') {
            Some((lo, hi)) => (lo.trim().parse()?, hi.trim().parse()?),
            None => (0u32, s.trim().parse()?),
        },
        None => (0, 0),
    };
    if let Some(task) = args.task.as_deref() {
        let (id, last): (u32, u32) = if task == "sge" {
            (
                std::env::var("SGE_TASK_ID")
                    .context("missing environment SGE_TASK_ID")?
                    .parse()?,
                std::env::var("SGE_TASK_LAST")
                    .context("missing environment SGE_TASK_LAST")?
                    .parse()?,
            )
        } else {
            match task.split_once(',') {
                Some((id, last)) => (id.trim().parse()?, last.trim().parse()?),
                None => bail!("bad --task: {task}"),
            }
        };
        if id == 0 || last == 0 || id > last {
            bail!("task id/last out of bounds: {id},{last}");
        }
        let lo = if sid_lo == 0 { 1 } else { sid_lo };
        let hi = if sid_hi == 0 { store.num_signature() } else { sid_hi };
        let slice = ((hi - lo) / last).max(1);
        sid_lo = lo + slice * (id - 1);
        sid_hi = if id == last { hi } else { lo + slice * id };
    }

    let processed = match &args.load {
        Some(path) => import_hints(&mut store, path)?,
        None => tally_hints(&mut store, &cfg, sid_lo, sid_hi)?,
    };

    if args.text {
        let mut stdout = std::io::stdout();
        export_hints(&store, &mut stdout)?;
    }

    if let Some(out) = &args.output_db {
        if let Err(e) = store.save(out, !args.no_saveindex) {
            let _ = std::fs::remove_file(out);
            return Err(e.into());
        }
    }

    eprintln!(
        "{{\"done\":\"gen-hint-db\",\"numSignature\":{},\"numHint\":{},\"processed\":{}}}",
        store.num_signature(),
        store.num_hint(),
        processed
    );
    Ok(())
}
