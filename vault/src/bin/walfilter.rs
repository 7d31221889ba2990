//! Inspect and rewrite WAL files: dump decoded records, or NOOP out the
//! records of selected transactions while preserving every byte offset.

use std::collections::HashSet;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tracing::info;

use postgres_ffi::{IsPartialXLogFileName, IsXLogFileName};
use utils::logging::{self, LogFormat};
use utils::lsn::Lsn;
use vault::walfilter::{filter_wal_files, FilterPredicate};
use wal_decoder::rmgr;
use wal_decoder::walfile::WalFileSet;

#[derive(Parser)]
#[command(name = "walfilter", about = "Filter and inspect PostgreSQL WAL files")]
struct Args {
    /// WAL segment files, directories of them, or tar archives of WAL.
    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,

    /// Directory rewritten segments are written to. Without it the tool
    /// only reads.
    #[arg(short = 'o', long)]
    output: Option<Utf8PathBuf>,

    /// NOOP every record of every transaction that performed a HEAP DELETE.
    #[arg(long)]
    delete_filter: bool,

    /// NOOP every record of the given transaction ids.
    #[arg(long, value_delimiter = ',')]
    xids: Vec<u32>,

    /// Print decoded records.
    #[arg(long)]
    dump: bool,

    /// Print decoded records as JSON.
    #[arg(long)]
    json: bool,

    /// Only dump records of these resource managers.
    #[arg(long, value_delimiter = ',')]
    rmgr: Vec<String>,

    /// Only dump records at or after this LSN.
    #[arg(long)]
    start_lsn: Option<Lsn>,

    /// Only dump records before this LSN.
    #[arg(long)]
    end_lsn: Option<Lsn>,

    /// Stop dumping after this many records.
    #[arg(long)]
    limit: Option<usize>,

    /// Log format: 'plain' or 'json'.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(LogFormat::from_config(&args.log_format)?)?;

    let inputs = collect_inputs(&args)?;
    anyhow::ensure!(!inputs.is_empty(), "no WAL files found in the inputs");
    info!("parsing {} WAL files", inputs.len());

    let mut named = Vec::with_capacity(inputs.len());
    for path in &inputs {
        let name = path.file_name().context("input without a file name")?;
        let raw = std::fs::read(path).with_context(|| format!("reading {path}"))?;
        named.push((name.to_string(), raw));
    }
    let mut set = WalFileSet::parse(named)?;
    for file in &set.files {
        for (lsn, error) in &file.errors {
            eprintln!("{}: record at {lsn}: {error}", file.file_name());
        }
    }

    if args.dump || args.json {
        dump_records(&set, &args);
    }

    let predicate = if args.delete_filter {
        Some(FilterPredicate::DeleteTransactions)
    } else if !args.xids.is_empty() {
        Some(FilterPredicate::Transactions(args.xids.clone()))
    } else {
        None
    };

    if let Some(predicate) = predicate {
        let output = args
            .output
            .as_ref()
            .context("--output is required when filtering")?;
        let summary = filter_wal_files(&mut set, &predicate)?;
        std::fs::create_dir_all(output)?;
        for file in &set.files {
            let target = output.join(file.file_name());
            std::fs::write(&target, &file.raw).with_context(|| format!("writing {target}"))?;
        }
        println!(
            "{} of {} records filtered ({} transactions), {} segments written to {output}",
            summary.records_filtered,
            summary.records_seen,
            summary.transactions,
            set.files.len()
        );
    }

    Ok(())
}

/// Expand the inputs: directories contribute their WAL files, tar archives
/// are unpacked next to the output first.
fn collect_inputs(args: &Args) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    for input in &args.inputs {
        if input.is_dir() {
            for entry in input.read_dir_utf8()? {
                let entry = entry?;
                let name = entry.file_name();
                if IsXLogFileName(name) || IsPartialXLogFileName(name) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else if input.extension() == Some("tar") {
            let scratch = match &args.output {
                Some(output) => output.join("extracted-wal"),
                None => Utf8PathBuf::from_path_buf(std::env::temp_dir())
                    .map_err(|_| anyhow::anyhow!("non-utf8 temp dir"))?
                    .join("walfilter-extracted"),
            };
            std::fs::create_dir_all(&scratch)?;
            let mut archive = tar::Archive::new(std::fs::File::open(input)?);
            archive.unpack(&scratch)?;
            for entry in walkdir::WalkDir::new(&scratch).sort_by_file_name() {
                let entry = entry?;
                let Some(path) = Utf8Path::from_path(entry.path()) else {
                    continue;
                };
                let Some(name) = path.file_name() else { continue };
                if entry.file_type().is_file() && (IsXLogFileName(name) || IsPartialXLogFileName(name))
                {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            files.push(input.clone());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn dump_records(set: &WalFileSet, args: &Args) {
    let version = match set.files.first() {
        Some(file) => file.version,
        None => return,
    };
    let rmgr_filter: HashSet<String> = args.rmgr.iter().map(|s| s.to_lowercase()).collect();
    let mut shown = 0usize;
    let mut summary = rmgr::RmgrSummary::default();

    for rec in set.records() {
        if let Some(start) = args.start_lsn {
            if rec.lsn < start {
                continue;
            }
        }
        if let Some(end) = args.end_lsn {
            if rec.lsn >= end {
                continue;
            }
        }
        let name = rmgr::rmgr_name(rec.header.xl_rmid);
        if !rmgr_filter.is_empty() && !rmgr_filter.contains(&name.to_lowercase()) {
            continue;
        }
        summary.add(rec);
        if let Some(limit) = args.limit {
            if shown >= limit {
                continue;
            }
        }
        shown += 1;

        let (rec_len, fpi_len) = rmgr::record_lengths(rec);
        let desc = rmgr::describe_record(rec, version);
        let refs = rmgr::describe_block_refs(rec, version);
        if args.json {
            let value = serde_json::json!({
                "ResourceManager": name,
                "RecordLength": rec_len,
                "FpiLength": fpi_len,
                "TotalLength": rec.header.xl_tot_len,
                "Xid": rec.header.xl_xid,
                "Info": rec.header.xl_info,
                "StartLSN": format!("{}", Lsn(rec.header.xl_prev)),
                "EndLSN": format!("{}", rec.lsn),
                "Crc": rec.header.xl_crc,
                "Description": format!("{desc}{refs}"),
            });
            println!("{value}");
        } else {
            println!(
                "{} | {} | {} | {} | {} | {} | {}{}",
                name,
                Lsn(rec.header.xl_prev),
                rec.lsn,
                rec_len,
                rec.header.xl_tot_len,
                rec.header.xl_xid,
                desc,
                refs
            );
        }
    }

    if !args.json {
        println!("---");
        for line in summary.lines() {
            println!("{line}");
        }
    }
}
