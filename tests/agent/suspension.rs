use crate::common::{CountingSuspender, rig};
use crate::{MODULE, T1};
use haltpoint::agent::suspend::{SuspendOutcome, SuspensionController};
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
#[serial]
fn test_second_request_without_release_is_noop() {
    let suspender = CountingSuspender::default();
    let ctl = SuspensionController::new();

    assert_eq!(
        ctl.request_suspension(false, &suspender),
        SuspendOutcome::Trapping
    );
    assert_eq!(
        ctl.request_suspension(false, &suspender),
        SuspendOutcome::AlreadyInProgress
    );
    // the primitive was asked once, not twice
    assert_eq!(suspender.suspend_calls.load(Ordering::SeqCst), 1);

    ctl.mark_stopped().unwrap();
    assert_eq!(
        ctl.request_suspension(false, &suspender),
        SuspendOutcome::AlreadyInProgress
    );

    ctl.release(&suspender, None);
    assert!(!ctl.is_suspended());
    assert_eq!(suspender.resume_calls.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn test_release_wakes_parked_threads() {
    let suspender = Arc::new(CountingSuspender::default());
    let ctl = Arc::new(SuspensionController::new());
    ctl.request_suspension(false, &*suspender);
    ctl.mark_stopped().unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.wait_until_resumed())
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    ctl.release(&*suspender, None);
    for w in waiters {
        w.join().unwrap();
    }
}

#[test]
#[serial]
fn test_disabled_engine_parks_call_ins() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();
    rig.agent.set_engine_disabled(true);

    let (tx, rx) = mpsc::channel();
    let agent = rig.agent.clone();
    thread::spawn(move || {
        let res = agent.on_module_loaded(MODULE);
        tx.send(res).unwrap();
    });

    // parked while the lock is disabled
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    rig.peer.set_auto_continue(true);
    rig.agent.set_engine_disabled(false);
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(!rig.agent.suspension().is_suspended());
}

#[test]
#[serial]
fn test_unsafe_region_scopes_nest_and_restore() {
    let rig = rig();
    {
        let _outer = rig.agent.enter_unsafe_region();
        let _inner = rig.agent.enter_unsafe_region();
        assert_eq!(rig.agent.suspension().threads_at_unsafe(), 2);
    }
    assert_eq!(rig.agent.suspension().threads_at_unsafe(), 0);
}
