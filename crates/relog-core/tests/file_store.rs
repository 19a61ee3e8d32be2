#![forbid(unsafe_code)]
//! The engine over file-backed media, reopened from disk.

use relog_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, ManualClock};
use relog_core::{Engine, EngineConfig};
use relog_types::{BlockNumber, InodeNumber, LogId};
use std::path::Path;
use std::sync::Arc;

const INODE: InodeNumber = InodeNumber(12);
const BASE_BLOCKS: u64 = 64;

fn open(dir: &Path, config: &EngineConfig, create: bool) -> (Engine, Arc<dyn BlockDevice>) {
    let base_path = dir.join("base.img");
    let base_file = if create {
        FileByteDevice::create(&base_path, BASE_BLOCKS * u64::from(config.block_size))
    } else {
        FileByteDevice::open(&base_path)
    }
    .expect("base file");
    let base: Arc<dyn BlockDevice> =
        Arc::new(ByteBlockDevice::new(base_file, config.block_size).expect("base view"));

    let media_len = config.layout().expect("layout").media_len();
    let media = (0..config.log_count)
        .map(|log| {
            let path = dir.join(format!("log-{log}.img"));
            let device = if create {
                FileByteDevice::create(&path, media_len)
            } else {
                FileByteDevice::open(&path)
            }
            .expect("segment file");
            Arc::new(device) as Arc<dyn ByteDevice>
        })
        .collect();

    let engine = Engine::open(
        config.clone(),
        Arc::clone(&base),
        media,
        Arc::new(ManualClock::new(0)),
    )
    .expect("open engine");
    (engine, base)
}

#[test]
fn committed_state_survives_reopen_from_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig::small(2, 64);

    let (engine, _) = open(dir.path(), &config, true);
    engine
        .write(INODE, BlockNumber(9), 0..512, &[9; 512])
        .expect("write");
    engine
        .write(INODE, BlockNumber(10), 0..16, &[1; 16])
        .expect("write");
    engine.shutdown().expect("shutdown");
    drop(engine);

    let (engine, base) = open(dir.path(), &config, false);
    assert_eq!(engine.recovery_report().replayed, 2);
    assert_eq!(
        engine.read_block(INODE, BlockNumber(9)).expect("read"),
        vec![9; 512]
    );

    engine.reclaim_segment(LogId(0)).expect("reclaim");
    engine.shutdown().expect("shutdown");
    assert_eq!(
        base.read_block(BlockNumber(9)).expect("base").as_slice(),
        &[9; 512]
    );
    let ten = base.read_block(BlockNumber(10)).expect("base");
    assert!(ten.as_slice()[..16].iter().all(|b| *b == 1));
    assert!(ten.as_slice()[16..].iter().all(|b| *b == 0));
}
