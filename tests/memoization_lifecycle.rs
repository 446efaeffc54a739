//! Cross-component scenarios over a real `FileBackend` on a temp directory:
//! the decision state machine (C6) driving the on-disk backend (C4) exactly
//! as a host application would, rather than the in-memory test double the
//! unit tests use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use recall::backend::file::{FileBackend, FileBackendConfig, Layout};
use recall::config::CallPolicy;
use recall::fingerprint::{CallArgs, DefaultFingerprinter};
use recall::orchestrator::{CallOverrides, Memoizer};
use recall::worker_pool::WorkerPool;
use recall_wire::FunctionId;

fn policy(stale_after: chrono::Duration, return_old_value_on_stale: bool) -> CallPolicy {
    CallPolicy {
        stale_after,
        return_old_value_on_stale,
        allow_none: false,
        wait_for_calc_timeout: std::time::Duration::from_secs(5),
    }
}

fn file_memoizer(root: &std::path::Path) -> Memoizer<FileBackend> {
    let config = FileBackendConfig {
        root: root.to_path_buf(),
        layout: Layout::SingleFile,
        watch: false,
    };
    let backend = FileBackend::open(&FunctionId::new("lifecycle", "quote"), &config).unwrap();
    Memoizer::new(backend, Arc::new(DefaultFingerprinter), false, Arc::new(WorkerPool::new(2)))
}

#[test]
fn a_fresh_miss_is_produced_once_and_then_served_from_disk() {
    // GIVEN: a file-backed memoizer over an empty cache directory
    // WHEN: the same call happens twice
    // THEN: the wrapped function runs exactly once, both calls return its result
    let tmp = tempfile::tempdir().unwrap();
    let memoizer = file_memoizer(tmp.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let invoke: Arc<dyn Fn(&CallArgs) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync> =
        Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"total": 42}))
        });
    let p = policy(chrono::Duration::weeks(1), false);

    let first = memoizer.call(&CallArgs::new(), CallOverrides::default(), p, Arc::clone(&invoke)).unwrap();
    let second = memoizer.call(&CallArgs::new(), CallOverrides::default(), p, Arc::clone(&invoke)).unwrap();

    assert_eq!(first, serde_json::json!({"total": 42}));
    assert_eq!(second, serde_json::json!({"total": 42}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn clear_cache_forces_a_fresh_file_backed_recompute() {
    // GIVEN: a file-backed memoizer holding a cached value
    // WHEN: clear_cache runs, then the same call repeats
    // THEN: the wrapped function is invoked again and the new result is stored
    let tmp = tempfile::tempdir().unwrap();
    let memoizer = file_memoizer(tmp.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let invoke: Arc<dyn Fn(&CallArgs) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync> =
        Arc::new(move |_| {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(n))
        });
    let p = policy(chrono::Duration::weeks(1), false);

    let first = memoizer.call(&CallArgs::new(), CallOverrides::default(), p, Arc::clone(&invoke)).unwrap();
    memoizer.clear_cache().unwrap();
    let second = memoizer.call(&CallArgs::new(), CallOverrides::default(), p, Arc::clone(&invoke)).unwrap();

    assert_eq!(first, serde_json::json!(0));
    assert_eq!(second, serde_json::json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn a_stale_hit_without_return_old_value_recomputes_synchronously() {
    // GIVEN: an entry whose staleness window has already elapsed
    // WHEN: a call observes it
    // THEN: the caller gets the freshly computed value, not the old one, and
    //       the on-disk entry is updated to match
    let tmp = tempfile::tempdir().unwrap();
    let memoizer = file_memoizer(tmp.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let invoke: Arc<dyn Fn(&CallArgs) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync> =
        Arc::new(move |_| {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(n))
        });

    let immediately_stale = policy(chrono::Duration::seconds(-1), false);
    let first = memoizer.call(&CallArgs::new(), CallOverrides::default(), immediately_stale, Arc::clone(&invoke)).unwrap();
    let second = memoizer.call(&CallArgs::new(), CallOverrides::default(), immediately_stale, Arc::clone(&invoke)).unwrap();

    assert_eq!(first, serde_json::json!(0));
    assert_eq!(second, serde_json::json!(1), "a stale hit with no return-old-value policy must recompute before returning");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn precache_seeds_an_entry_without_ever_invoking_the_function() {
    // GIVEN: a function never invoked before
    // WHEN: precache inserts a value directly
    // THEN: the next call hits the precached value and never runs the function
    let tmp = tempfile::tempdir().unwrap();
    let memoizer = file_memoizer(tmp.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let invoke: Arc<dyn Fn(&CallArgs) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync> =
        Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!("computed"))
        });

    memoizer.precache(&CallArgs::new(), serde_json::json!("precached")).unwrap();
    let p = policy(chrono::Duration::weeks(1), false);
    let result = memoizer.call(&CallArgs::new(), CallOverrides::default(), p, Arc::clone(&invoke)).unwrap();

    assert_eq!(result, serde_json::json!("precached"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
