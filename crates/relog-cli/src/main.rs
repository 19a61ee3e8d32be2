#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use relog::{
    BlockDevice, BlockNumber, ByteBlockDevice, ByteDevice, Engine, EngineConfig, FileByteDevice,
    InodeNumber, LogId, MemoryStore, MonotonicClock, PoolStats, RelogError,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const MANIFEST: &str = "relog.json";
const BASE_IMAGE: &str = "base.img";
const DEFAULT_BASE_BLOCKS: u64 = 4096;

/// On-disk description of a store directory.
#[derive(Debug, Serialize, Deserialize)]
struct StoreManifest {
    base_blocks: u64,
    config: EngineConfig,
}

#[derive(Debug, Serialize)]
struct StressOutput {
    sessions: usize,
    ops_per_session: u64,
    commits: u64,
    conflicts: u64,
    elapsed_ms: u128,
    stats: PoolStats,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "format" => {
            let (dir, options) = split_dir(&rest, "format")?;
            let config = match flag_value(&options, "--config")? {
                Some(path) => {
                    let raw = fs::read_to_string(&path)
                        .with_context(|| format!("failed to read config: {path}"))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("invalid config json: {path}"))?
                }
                None => EngineConfig::default(),
            };
            let base_blocks = match flag_value(&options, "--base-blocks")? {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid --base-blocks: {raw}"))?,
                None => DEFAULT_BASE_BLOCKS,
            };
            format_cmd(&dir, config, base_blocks)
        }
        "inspect" => {
            let (dir, options) = split_dir(&rest, "inspect")?;
            let json = options.iter().any(|arg| arg == "--json");
            inspect_cmd(&dir, json)
        }
        "recover" => {
            let (dir, _) = split_dir(&rest, "recover")?;
            recover_cmd(&dir)
        }
        "stress" => {
            let ops = match flag_value(&rest, "--ops")? {
                Some(raw) => raw.parse().with_context(|| format!("invalid --ops: {raw}"))?,
                None => 200,
            };
            let sessions = match flag_value(&rest, "--sessions")? {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid --sessions: {raw}"))?,
                None => 4,
            };
            let json = rest.iter().any(|arg| arg == "--json");
            stress_cmd(ops, sessions, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => bail!("unknown command: {command}"),
    }
}

fn print_usage() {
    println!("relog-cli: redirect-on-write log store tooling");
    println!();
    println!("Usage:");
    println!("  relog-cli format <dir> [--config <file.json>] [--base-blocks <n>]");
    println!("  relog-cli inspect <dir> [--json]");
    println!("  relog-cli recover <dir>");
    println!("  relog-cli stress [--ops <n>] [--sessions <n>] [--json]");
}

fn split_dir(args: &[String], command: &str) -> Result<(PathBuf, Vec<String>)> {
    let Some(dir) = args.first() else {
        bail!("{command} requires a store directory");
    };
    Ok((PathBuf::from(dir), args[1..].to_vec()))
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    match args.get(pos + 1) {
        Some(value) => Ok(Some(value.clone())),
        None => bail!("{flag} requires a value"),
    }
}

fn segment_path(dir: &Path, log: usize) -> PathBuf {
    dir.join(format!("log-{log}.img"))
}

fn format_cmd(dir: &Path, config: EngineConfig, base_blocks: u64) -> Result<()> {
    config.validate().context("invalid engine config")?;
    let layout = config.layout().context("invalid segment layout")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create store directory: {}", dir.display()))?;
    if dir.join(MANIFEST).exists() {
        bail!("store already formatted: {}", dir.display());
    }

    let base_len = base_blocks
        .checked_mul(u64::from(config.block_size))
        .context("base store size overflows")?;
    FileByteDevice::create(dir.join(BASE_IMAGE), base_len).context("failed to create base image")?;
    for log in 0..config.log_count {
        let path = segment_path(dir, log);
        FileByteDevice::create(&path, layout.media_len())
            .with_context(|| format!("failed to create segment media: {}", path.display()))?;
    }

    let manifest = StoreManifest {
        base_blocks,
        config,
    };
    let raw = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
    fs::write(dir.join(MANIFEST), raw).context("failed to write manifest")?;

    // First open writes the segment headers.
    let engine = open_store(dir)?;
    engine.shutdown().context("failed to flush new store")?;
    println!(
        "formatted {} (segments={}, segment_blocks={}, block_size={}, base_blocks={})",
        dir.display(),
        manifest.config.log_count,
        manifest.config.segment_blocks,
        manifest.config.block_size,
        base_blocks
    );
    Ok(())
}

fn open_store(dir: &Path) -> Result<Engine> {
    let raw = fs::read_to_string(dir.join(MANIFEST))
        .with_context(|| format!("not a relog store: {}", dir.display()))?;
    let manifest: StoreManifest = serde_json::from_str(&raw).context("invalid manifest")?;
    let config = manifest.config;

    let base_file =
        FileByteDevice::open(dir.join(BASE_IMAGE)).context("failed to open base image")?;
    let base = ByteBlockDevice::new(base_file, config.block_size)
        .context("base image does not match block size")?;
    if base.block_count() != manifest.base_blocks {
        bail!(
            "base image holds {} blocks, manifest says {}",
            base.block_count(),
            manifest.base_blocks
        );
    }

    let mut media: Vec<Arc<dyn ByteDevice>> = Vec::with_capacity(config.log_count);
    for log in 0..config.log_count {
        let path = segment_path(dir, log);
        let device = FileByteDevice::open(&path)
            .with_context(|| format!("failed to open segment media: {}", path.display()))?;
        media.push(Arc::new(device));
    }

    Engine::open(config, Arc::new(base), media, Arc::new(MonotonicClock::new()))
        .with_context(|| format!("failed to open store: {}", dir.display()))
}

fn print_stats(stats: &PoolStats) {
    println!("current: {}", stats.current);
    match stats.remapping {
        Some(log) => println!("remapping: {log}"),
        None => println!("remapping: none"),
    }
    println!("last_commit_seq: {}", stats.last_commit_seq);
    println!("reclaim_rounds: {}", stats.reclaim_rounds);
    for segment in &stats.segments {
        println!(
            "segment {}: state={:?} generation={} write_cursor={} capacity={} inflight={}",
            segment.log,
            segment.state,
            segment.generation,
            segment.write_cursor,
            segment.capacity_bytes,
            segment.inflight
        );
    }
    for tree in &stats.trees {
        println!(
            "inode {}: entries={} pending_remap={} superseded={} failed={} size={}",
            tree.inode,
            tree.entries,
            tree.pending_remap,
            tree.superseded,
            tree.failed_blocks,
            tree.logical_size
        );
    }
}

fn inspect_cmd(dir: &Path, json: bool) -> Result<()> {
    let engine = open_store(dir)?;
    let stats = engine.stats();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context("serialize output")?
        );
    } else {
        println!("relog store {}", dir.display());
        print_stats(&stats);
    }
    Ok(())
}

fn recover_cmd(dir: &Path) -> Result<()> {
    let engine = open_store(dir)?;
    let report = engine.recovery_report().clone();
    println!(
        "replayed {} descriptors (last_commit_seq={})",
        report.replayed, report.last_commit_seq
    );
    if !report.formatted.is_empty() {
        println!("formatted blank segments: {:?}", report.formatted);
    }
    if !report.interrupted.is_empty() {
        println!("interrupted reclamation: {:?}", report.interrupted);
    }

    for segment in engine.stats().segments {
        if segment.write_cursor == 0 {
            continue;
        }
        let log = LogId(segment.log);
        let reclaimed = engine
            .reclaim_segment(log)
            .with_context(|| format!("failed to reclaim segment {log}"))?;
        println!(
            "segment {}: written_back={} retired={} failed={} generation={}",
            reclaimed.log,
            reclaimed.written_back,
            reclaimed.retired,
            reclaimed.failed,
            reclaimed.generation
        );
    }
    engine.shutdown().context("failed to flush store")?;
    Ok(())
}

fn stress_cmd(ops: u64, sessions: usize, json: bool) -> Result<()> {
    if sessions == 0 {
        bail!("--sessions must be at least 1");
    }
    let config = EngineConfig::small(4, 128);
    let store = MemoryStore::new(&config, 256).context("failed to size store")?;
    let engine = store
        .open(config, Arc::new(MonotonicClock::new()))
        .context("failed to open in-memory store")?;
    let reclaimer = engine
        .spawn_reclaimer(Duration::from_millis(2))
        .context("failed to start reclaimer")?;

    let commits = Arc::new(AtomicU64::new(0));
    let conflicts = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..sessions)
        .map(|worker| {
            let engine = engine.clone();
            let commits = Arc::clone(&commits);
            let conflicts = Arc::clone(&conflicts);
            thread::spawn(move || -> Result<()> {
                let worker = u64::try_from(worker).context("worker index")?;
                let session = engine.open_session(InodeNumber(1));
                for op in 0..ops {
                    // Every worker shares blocks 0..8; each owns a 64-byte band
                    // and sometimes spills into its neighbour's.
                    let block = BlockNumber(op % 8);
                    let band = u32::try_from(worker % 8).context("band")? * 64;
                    let len = if op % 5 == 0 { 96 } else { 64 };
                    let start = band.min(512 - len);
                    let fill = u8::try_from(op % 251).context("fill")?;
                    let data = vec![fill; usize::try_from(len).context("len")?];

                    let outcome = session
                        .write(block, start, &data)
                        .and_then(|()| session.commit());
                    match outcome {
                        Ok(()) => {
                            commits.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(RelogError::ConflictAborted { .. }) => {
                            conflicts.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) if err.is_retryable() => {
                            thread::sleep(Duration::from_millis(1));
                        }
                        Err(err) => return Err(err).context("stress write failed"),
                    }
                }
                engine.close_session(session).context("close session")?;
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("stress worker panicked"),
        }
    }
    reclaimer.stop();

    let output = StressOutput {
        sessions,
        ops_per_session: ops,
        commits: commits.load(Ordering::Relaxed),
        conflicts: conflicts.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis(),
        stats: engine.stats(),
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!(
            "{} sessions x {} ops: commits={} conflicts={} elapsed={}ms",
            output.sessions,
            output.ops_per_session,
            output.commits,
            output.conflicts,
            output.elapsed_ms
        );
        print_stats(&output.stats);
    }
    Ok(())
}
