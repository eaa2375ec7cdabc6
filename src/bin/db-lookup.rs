// SPDX-License-Identifier: Apache-2.0

//! Query a database from the command line.
//!
//! A numeric argument (decimal, hex or octal) shows the transform with
//! that id; anything else is treated as a transform name. A trailing
//! `--tree <name>` looks an expression up through the imprint index.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use muxdb::store::Store;
use muxdb::tree::TinyTree;
use muxdb::Config;

#[derive(Debug, Parser)]
#[command(name = "db-lookup")]
#[command(about = "Look up transforms and trees in a muxdb database")]
struct Args {
    /// Database to query.
    #[arg(long, short = 'D', default_value = "muxdb.db")]
    database: PathBuf,

    /// Look the arguments up as trees through the imprint index instead
    /// of as transforms.
    #[arg(long)]
    tree: bool,

    /// Transform ids, transform names, or tree names with --tree.
    args: Vec<String>,
}

fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else if s.starts_with('0') && s.len() > 1 {
        u32::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

fn lookup_transform(db: &Store, arg: &str) {
    let tid = match parse_number(arg) {
        Some(tid) => {
            if tid >= db.num_transform() {
                println!("tid={tid} not found");
                return;
            }
            tid
        }
        None => match db.lookup_fwd_transform(arg) {
            Some(tid) => tid,
            None => {
                println!("invalid transform: \"{arg}\"");
                return;
            }
        },
    };

    let rid = db.rev_id(tid);
    println!(
        "fwd={}:{} rev={}:{}",
        tid,
        db.fwd_name(tid),
        rid,
        db.fwd_name(rid)
    );
}

fn lookup_tree(db: &Store, cfg: &Config, arg: &str) {
    let mut tree = TinyTree::new(cfg);
    if let Err(e) = tree.decode_safe(arg) {
        println!("{}", e.to_json());
        return;
    }

    match db.lookup_imprint_associative(&tree) {
        Some((sid, tid)) => {
            let sig = db.signature(sid);
            println!(
                "sid={} name={} tid={}:{} safe={} firstMember={}",
                sid,
                sig.name_str(),
                tid,
                db.fwd_name(tid),
                sig.is_safe() as u32,
                sig.first_member
            );
        }
        None => println!("\"{arg}\" not found"),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let db = Store::open(&args.database)
        .with_context(|| format!("opening {}", args.database.display()))?;
    if db.num_transform() == 0 {
        anyhow::bail!("missing transform section: {}", args.database.display());
    }

    let cfg = Config::default();
    for arg in &args.args {
        if args.tree {
            lookup_tree(&db, &cfg, arg);
        } else {
            lookup_transform(&db, arg);
        }
    }

    Ok(())
}
