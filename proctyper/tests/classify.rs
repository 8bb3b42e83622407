use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use proctyper::tracker::PortTracker;
use proctyper::typer::{
    ExecutableInfo, Inspection, Inspector, Typer, cache::ClassificationCache,
    limiter::InspectionLimiter,
};
use proctyper_common::{ExecutableIdentity, RuntimeKind};

/// Classifies every odd inode as Python and counts inspections.
struct CountingInspector {
    calls: AtomicUsize,
}

impl Inspector for CountingInspector {
    fn inspect(&self, exe: &ExecutableInfo) -> Result<Inspection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        let kind = if exe.identity.ino % 2 == 1 {
            RuntimeKind::Python
        } else {
            RuntimeKind::Generic
        };
        Ok(Inspection {
            kind,
            offsets: None,
        })
    }
}

fn exe(pid: u32, ino: u64) -> ExecutableInfo {
    ExecutableInfo {
        pid,
        exe_path: PathBuf::from(format!("/usr/bin/app{}", ino)),
        identity: ExecutableIdentity::new(8, ino),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_storm_inspects_each_binary_once() {
    let inspector = Arc::new(CountingInspector {
        calls: AtomicUsize::new(0),
    });
    let cache = Arc::new(ClassificationCache::new(NonZeroUsize::new(8).unwrap(), None));
    let limiter = InspectionLimiter::new(NonZeroUsize::new(2).unwrap());
    let typer = Arc::new(Typer::with_parts(
        Arc::clone(&cache),
        limiter,
        inspector.clone(),
    ));

    // 200 processes spread over 4 distinct binaries
    let mut tasks = Vec::new();
    for pid in 0..200u32 {
        let typer = Arc::clone(&typer);
        tasks.push(tokio::spawn(async move {
            typer.classify(&exe(pid, (pid % 4) as u64)).await
        }));
    }
    for (pid, task) in tasks.into_iter().enumerate() {
        let result = task.await.unwrap();
        let expected = if pid % 4 % 2 == 1 {
            RuntimeKind::Python
        } else {
            RuntimeKind::Generic
        };
        assert_eq!(result.kind, expected);
    }

    assert_eq!(inspector.calls.load(Ordering::SeqCst), 4);
    assert_eq!(cache.len(), 4);
    assert!(typer.inflight().is_empty());
}

#[tokio::test]
async fn cache_stays_bounded_under_many_binaries() {
    let inspector = Arc::new(CountingInspector {
        calls: AtomicUsize::new(0),
    });
    let cache = Arc::new(ClassificationCache::new(NonZeroUsize::new(3).unwrap(), None));
    let typer = Typer::with_parts(
        Arc::clone(&cache),
        InspectionLimiter::new(NonZeroUsize::new(1).unwrap()),
        inspector.clone(),
    );

    for ino in 0..10 {
        typer.classify(&exe(1, ino)).await;
        assert!(cache.len() <= 3);
    }

    // the oldest binaries were evicted and need a new inspection
    typer.classify(&exe(1, 0)).await;
    assert_eq!(inspector.calls.load(Ordering::SeqCst), 11);
    // the newest are still cached
    typer.classify(&exe(1, 9)).await;
    assert_eq!(inspector.calls.load(Ordering::SeqCst), 11);
}

#[test]
fn port_tracker_caps_connection_churn() {
    let tracker = PortTracker::new(NonZeroUsize::new(64).unwrap());

    // a load generator opening thousands of short-lived connections
    for port in 30000..35000u16 {
        tracker.add(1234, port);
    }
    assert_eq!(tracker.len(1234), 64);
    assert_eq!(tracker.rejected(1234), 5000 - 64);

    assert!(tracker.remove_owner(1234));
    assert_eq!(tracker.owners(), 0);
}
