//! End-to-end pipeline scenarios: raw probe events through the kernel-side
//! merger, the wire transport, and the userspace filter, checked against
//! the jobs a real indexer would need to apply.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anything_indexd::config::Config;
use anything_indexd::event::merge::KernelMerger;
use anything_indexd::event::{Action, DeviceId, FsEvent};
use anything_indexd::filter::Filter;
use anything_indexd::jobqueue::JobKind;
use anything_indexd::mount::PartitionTable;
use anything_indexd::transport;

fn scoped_config(roots: &[&str]) -> Config {
    let mut cfg = Config::from_str("").unwrap();
    cfg.indexing_paths = roots.iter().map(PathBuf::from).collect();
    cfg
}

/// Runs `raw` events through a fresh kernel merger, splits the drained
/// events onto the wire, decodes them, and feeds them through a fresh
/// userspace filter, returning the resulting jobs.
fn run_pipeline(raw: Vec<FsEvent>, config: Config, mounts: &PartitionTable) -> Vec<(PathBuf, Option<PathBuf>, JobKind)> {
    let mut merger = KernelMerger::new(16 * 1024 * 1024);
    for event in raw {
        merger.observe(event);
    }
    let merged = merger.drain(1024);

    let filter = Filter::new(Arc::new(RwLock::new(config)), Arc::new(RwLock::new(HashSet::new())));
    let mut jobs = Vec::new();
    for event in merged {
        for message in transport::split_for_wire(&event).unwrap() {
            let decoded = transport::message_to_raw_event(&message).unwrap();
            for job in filter.observe(decoded, mounts) {
                jobs.push((job.src, job.dst, job.kind));
            }
        }
    }
    jobs
}

#[test]
fn scenario_create_then_delete_coalesces_to_nothing() {
    let dev = DeviceId::new(8, 1);
    let raw = vec![
        FsEvent::new(Action::NewFile, dev, PathBuf::from("/home/u/draft.txt")),
        FsEvent::new(Action::DelFile, dev, PathBuf::from("/home/u/draft.txt")),
    ];
    let jobs = run_pipeline(raw, scoped_config(&["/home"]), &PartitionTable::new());
    assert!(jobs.is_empty(), "create+delete with nothing in between should vanish: {jobs:?}");
}

#[test]
fn scenario_rename_across_scope_boundary() {
    let dev = DeviceId::new(8, 1);
    let raw = vec![
        FsEvent::new(Action::RenameFromFile, dev, PathBuf::from("/home/u/x.txt")),
        FsEvent { cookie: 0, ..FsEvent::new(Action::RenameToFile, dev, PathBuf::from("/tmp/x.txt")) },
    ];
    let jobs = run_pipeline(raw, scoped_config(&["/home"]), &PartitionTable::new());
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0], (PathBuf::from("/home/u/x.txt"), None, JobKind::Remove));
}

#[test]
fn scenario_directory_rename_inside_scope_fixes_up_descendants() {
    let dev = DeviceId::new(8, 1);
    let raw = vec![
        FsEvent::new(Action::RenameFromFolder, dev, PathBuf::from("/home/u/old")),
        FsEvent { cookie: 0, ..FsEvent::new(Action::RenameToFolder, dev, PathBuf::from("/home/u/new")) },
    ];
    let jobs = run_pipeline(raw, scoped_config(&["/home"]), &PartitionTable::new());
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0], (PathBuf::from("/home/u/old"), Some(PathBuf::from("/home/u/new")), JobKind::RenameDescendants));
}

#[test]
fn scenario_bind_mount_path_resolves_through_the_mount_table() {
    let mountinfo = "\
36 35 98:0 / / rw - ext4 /dev/root rw
38 37 98:1 / /home/u/mnt rw,relatime master:2 - ext4 /dev/sda2 rw,bind
";
    let mut mounts = PartitionTable::new();
    // `rebuild` is async; scenarios run on the default test executor so we
    // drive it to completion with a tiny blocking runtime.
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    rt.block_on(mounts.rebuild(mountinfo));

    assert_eq!(
        mounts.hardreal(&PathBuf::from("/home/u/mnt/report.doc"), &HashSet::new()).unwrap().source,
        "/dev/sda2"
    );

    let dev = DeviceId::new(98, 1);
    let raw = vec![FsEvent::new(Action::NewFile, dev, PathBuf::from("/home/u/mnt/report.doc"))];
    let jobs = run_pipeline(raw, scoped_config(&["/home"]), &mounts);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].0, PathBuf::from("/home/u/mnt/report.doc"));
    assert_eq!(jobs[0].2, JobKind::Insert);
}

#[test]
fn scenario_memory_bound_discards_oldest_under_pressure() {
    let mut merger = KernelMerger::new(32 * 1024);
    let dev = DeviceId::new(8, 1);
    for i in 0..5_000 {
        merger.observe(FsEvent::new(Action::NewFile, dev, PathBuf::from(format!("/home/u/{i:05}-{}", "x".repeat(200)))));
    }
    let stats = merger.stats();
    assert!(stats.current_memory as usize <= 32 * 1024);
    assert!(stats.discarded > 0);
}

#[test]
fn scenario_pinyin_tokenisation_of_report_doc() {
    let terms = anything_indexd::pinyin::index_terms("报告.doc");
    for expected in ["bao", "gao", "bg", "baogao", "bg.doc"] {
        assert!(terms.split_whitespace().any(|t| t == expected), "missing {expected} in {terms:?}");
    }
    let file_terms = anything_indexd::tokenizer::tokenize("报告.doc");
    assert_eq!(file_terms, vec!["报", "告", "doc"]);
}

#[test]
fn unmatched_rename_from_ages_out_without_emitting_a_job() {
    let dev = DeviceId::new(8, 1);
    let mut merger = KernelMerger::new(16 * 1024 * 1024);
    merger.observe(FsEvent::new(Action::RenameFromFile, dev, PathBuf::from("/home/u/x.txt")));
    let removed = merger.age_out_pending_renames(Duration::from_secs(0));
    assert_eq!(removed, 1);
    assert!(merger.drain(10).is_empty());
}
