use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::test_utils::{capture, pipe, write_fd};
use crate::{PollFile, Proactor};

#[test]
fn test_run_without_work_returns_immediately() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    assert_eq!(ctx.run()?, 0);
    assert_eq!(ctx.poll()?, 0);
    Ok(())
}

#[test]
fn test_posts_run_in_order_on_the_driver() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        let order = Arc::clone(&order);
        exec.post(move || order.lock().push(i))?;
    }
    assert!(order.lock().is_empty(), "post never runs on the calling frame");

    assert_eq!(ctx.run()?, 3);
    assert_eq!(*order.lock(), vec![0, 1, 2]);
    Ok(())
}

#[test]
fn test_run_one_takes_a_single_handler() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let hits = Arc::clone(&hits);
        exec.post(move || {
            hits.fetch_add(1, Ordering::Relaxed);
        })?;
    }

    assert_eq!(ctx.run_one()?, 1);
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    // A driver session always parks the context; restart resumes.
    assert_eq!(ctx.run()?, 0);
    ctx.restart()?;
    assert_eq!(ctx.run()?, 1);
    assert_eq!(hits.load(Ordering::Relaxed), 2);
    Ok(())
}

#[test]
fn test_run_one_skips_internal_wakeups() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();

    // Park a stale stop completion in the ring: the stopped entry check
    // returns before the driver ever reaps it.
    ctx.stop();
    assert_eq!(ctx.run()?, 0);
    ctx.restart()?;

    let hit = Arc::new(AtomicBool::new(false));
    {
        let hit = Arc::clone(&hit);
        exec.post(move || hit.store(true, Ordering::Relaxed))?;
    }

    // run_one consumes the stale stop event, re-arms its poller and
    // still delivers the posted handler before returning.
    assert_eq!(ctx.run_one()?, 1);
    assert!(hit.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn test_poll_one_picks_up_ready_work() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    let hit = Arc::new(AtomicBool::new(false));

    {
        let hit = Arc::clone(&hit);
        exec.post(move || hit.store(true, Ordering::Relaxed))?;
    }
    assert_eq!(ctx.poll_one()?, 1);
    assert!(hit.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn test_handler_posting_more_work_extends_the_run() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    let hits = Arc::new(AtomicUsize::new(0));

    {
        let exec = exec.clone();
        let hits = Arc::clone(&hits);
        exec.clone().post(move || {
            hits.fetch_add(1, Ordering::Relaxed);
            let hits = Arc::clone(&hits);
            exec.post(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        })?;
    }

    assert_eq!(ctx.run()?, 2);
    assert_eq!(hits.load(Ordering::Relaxed), 2);
    Ok(())
}

#[test]
fn test_dispatch_is_inline_only_on_the_driver_thread() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert!(!exec.running_in_this_thread());
    {
        // Off the driver thread dispatch degrades to post.
        let order = Arc::clone(&order);
        exec.dispatch(move || order.lock().push("external"))?;
    }
    assert!(order.lock().is_empty());

    {
        let exec2 = exec.clone();
        let order = Arc::clone(&order);
        exec.post(move || {
            assert!(exec2.running_in_this_thread());
            order.lock().push("outer-start");
            let inner = Arc::clone(&order);
            exec2.dispatch(move || inner.lock().push("inline")).unwrap();
            order.lock().push("outer-end");
        })?;
    }

    assert_eq!(ctx.run()?, 2);
    assert_eq!(
        *order.lock(),
        vec!["external", "outer-start", "inline", "outer-end"]
    );
    Ok(())
}

#[test]
fn test_stop_parks_and_restart_resumes() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    let hit = Arc::new(AtomicBool::new(false));

    {
        let hit = Arc::clone(&hit);
        exec.post(move || hit.store(true, Ordering::Relaxed))?;
    }
    ctx.stop();
    assert_eq!(ctx.run()?, 0);
    assert!(!hit.load(Ordering::Relaxed));

    ctx.restart()?;
    assert_eq!(ctx.run()?, 1);
    assert!(hit.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn test_restart_is_idempotent() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    ctx.restart()?;
    ctx.restart()?;
    let exec = ctx.executor();
    exec.post(|| {})?;
    assert_eq!(ctx.run()?, 1);
    Ok(())
}

#[test]
fn test_stop_wakes_a_blocked_driver() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    exec.on_work_started();

    thread::scope(|s| {
        let driver = s.spawn(|| ctx.run());
        thread::sleep(Duration::from_millis(20));
        ctx.stop();
        let ran = driver.join().expect("driver thread exits cleanly");
        assert_eq!(ran.expect("driver returns"), 0);
    });

    exec.on_work_finished();
    Ok(())
}

#[test]
fn test_releasing_outstanding_work_returns_a_blocked_driver() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    exec.on_work_started();
    exec.on_work_started();

    thread::scope(|s| {
        let driver = s.spawn(|| ctx.run());
        thread::sleep(Duration::from_millis(20));
        exec.on_work_finished();
        exec.on_work_finished();
        let ran = driver.join().expect("driver thread exits cleanly");
        assert_eq!(ran.expect("driver returns"), 0);
    });
    Ok(())
}

#[test]
fn test_cross_thread_post_wakes_a_blocked_driver() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    // Keep the driver alive until the post lands.
    exec.on_work_started();
    let hit = Arc::new(AtomicBool::new(false));

    thread::scope(|s| -> anyhow::Result<()> {
        let driver = s.spawn(|| ctx.run());
        thread::sleep(Duration::from_millis(20));
        {
            let hit = Arc::clone(&hit);
            let exec = ctx.executor();
            exec.post(move || hit.store(true, Ordering::Relaxed))?;
        }
        exec.on_work_finished();
        let ran = driver.join().expect("driver thread exits cleanly")?;
        assert_eq!(ran, 1);
        Ok(())
    })?;

    assert!(hit.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn test_running_in_this_thread_is_scoped_to_the_driver() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    assert!(!ctx.running_in_this_thread());

    let observed = Arc::new(AtomicBool::new(false));
    {
        let exec2 = exec.clone();
        let observed = Arc::clone(&observed);
        exec.post(move || {
            observed.store(exec2.running_in_this_thread(), Ordering::Relaxed);
        })?;
    }

    thread::scope(|s| {
        let outside = s.spawn(|| exec.running_in_this_thread());
        assert!(!outside.join().unwrap());
    });

    assert_eq!(ctx.run()?, 1);
    assert!(observed.load(Ordering::Relaxed));
    assert!(!ctx.running_in_this_thread());
    Ok(())
}

#[test]
fn test_executor_equality_tracks_the_backing_proactor() -> anyhow::Result<()> {
    let a = Proactor::new(32)?;
    let b = Proactor::new(32)?;
    assert_eq!(a.executor(), a.executor());
    assert_ne!(a.executor(), b.executor());
    Ok(())
}

#[test]
fn test_panicking_post_propagates_and_the_driver_recovers() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();
    let hit = Arc::new(AtomicBool::new(false));

    exec.post(|| panic!("handler exploded"))?;
    {
        let hit = Arc::clone(&hit);
        exec.post(move || hit.store(true, Ordering::Relaxed))?;
    }

    let unwound = catch_unwind(AssertUnwindSafe(|| ctx.run()));
    assert!(unwound.is_err());
    assert!(!hit.load(Ordering::Relaxed));

    // The queue poller was consumed by the interrupted session, so a
    // restart re-arms it; the surviving handler is still delivered.
    ctx.restart()?;
    assert_eq!(ctx.run()?, 1);
    assert!(hit.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn test_panicking_completion_handler_leaves_state_consistent() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let (r, w) = pipe()?;
    let file = PollFile::new(&ctx, r)?;

    file.async_poll_in(|_| panic!("completion exploded"))?;
    write_fd(&w, b"x")?;

    let unwound = catch_unwind(AssertUnwindSafe(|| ctx.run()));
    assert!(unwound.is_err());

    // No restart needed after a completion-handler panic.
    assert_eq!(ctx.run()?, 0);
    Ok(())
}

#[test]
fn test_drop_with_inflight_operation_discards_its_continuation() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let (r, _w) = pipe()?;
    let file = PollFile::new(&ctx, r)?;

    let (slot, set) = capture::<std::io::Result<()>>();
    file.async_poll_in(set)?;
    drop(file);
    drop(ctx);

    assert!(slot.lock().is_none(), "shutdown never invokes continuations");
    Ok(())
}

#[test]
fn test_work_keeps_poll_from_reporting_out_of_work() -> anyhow::Result<()> {
    let ctx = Proactor::new(32)?;
    let exec = ctx.executor();

    exec.on_work_started();
    // Nothing runnable, but the context is not out of work either: the
    // non-blocking sweep returns without parking forever.
    assert_eq!(ctx.poll()?, 0);
    exec.on_work_finished();

    ctx.restart()?;
    assert_eq!(ctx.run()?, 0);
    Ok(())
}
