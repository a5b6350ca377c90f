use crate::common::rig;
use crate::{METHOD_A, MODULE};
use haltpoint::agent::code::{CodeVersion, ThreadHandle};
use haltpoint::agent::event::proto::DbgCommand;
use haltpoint::agent::patch::{PatchKind, PatchLocation, PatchRequest};
use serial_test::serial;
use std::thread;
use std::time::Duration;

#[test]
#[serial]
fn test_detach_under_load() {
    let rig = rig();
    rig.attach();

    let workers = 4u64;
    let mut points = vec![];
    for i in 0..workers {
        let il = 10 + i as u32 * 10;
        points.push((il, 0x100 + il as u64, true, false));
    }
    rig.publish(MODULE, METHOD_A, 1, &points);

    let mut patches = vec![];
    for (il, _, _, _) in &points {
        let patch = rig
            .agent
            .add_patch(PatchRequest {
                module: MODULE,
                method: METHOD_A,
                location: PatchLocation::Il(*il),
                kind: PatchKind::Breakpoint,
                version: Some(CodeVersion(1)),
                instantiation_filter: None,
                all_instantiations: false,
            })
            .unwrap();
        patches.push(patch);
    }

    for i in 0..workers {
        rig.agent.on_thread_created(ThreadHandle(i)).unwrap();
    }

    // every worker reports its own hit; whoever wins the lock first runs the
    // cycle and ends up dispatching the detach
    let handles: Vec<_> = patches
        .iter()
        .enumerate()
        .map(|(i, patch)| {
            let agent = rig.agent.clone();
            let patch = *patch;
            thread::spawn(move || agent.on_breakpoint_hit(patch, ThreadHandle(i as u64)))
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    rig.peer.push_command(DbgCommand::Detach);

    for h in handles {
        h.join().unwrap().unwrap();
    }

    assert!(!rig.agent.suspension().is_suspended());
    assert!(!rig.agent.is_peer_attached());
    assert!(rig.agent.patches().list().is_empty());
}

#[test]
#[serial]
fn test_detach_is_idempotent() {
    let rig = rig();
    rig.attach();
    rig.agent.dispatch_command(DbgCommand::Detach).unwrap();
    rig.agent.dispatch_command(DbgCommand::Detach).unwrap();

    let replies = rig.peer.replies();
    assert_eq!(replies.len(), 3);
    assert!(replies[1].result.is_ok());
    assert!(replies[2].result.is_ok());
    assert!(!rig.agent.is_peer_attached());
}

#[test]
#[serial]
fn test_transport_failure_is_an_implicit_detach() {
    let rig = rig();
    rig.agent.on_thread_created(ThreadHandle(1)).unwrap();
    rig.attach();

    rig.peer.break_transport();
    // the event send fails, the engine treats the peer as gone and keeps going
    rig.agent.on_module_loaded(MODULE).unwrap();

    assert!(!rig.agent.is_peer_attached());
    assert!(!rig.agent.suspension().is_suspended());
}

#[test]
#[serial]
fn test_host_requested_detach_clears_state() {
    let rig = rig();
    rig.attach();
    rig.agent
        .add_patch(PatchRequest {
            module: MODULE,
            method: METHOD_A,
            location: PatchLocation::Il(10),
            kind: PatchKind::Breakpoint,
            version: Some(CodeVersion(1)),
            instantiation_filter: None,
            all_instantiations: false,
        })
        .unwrap();

    rig.agent.request_detach().unwrap();
    assert!(!rig.agent.is_peer_attached());
    assert!(rig.agent.patches().list().is_empty());
}
