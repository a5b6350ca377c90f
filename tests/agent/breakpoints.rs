use crate::common::rig;
use crate::{METHOD_A, MODULE, T1};
use haltpoint::agent::code::CodeVersion;
use haltpoint::agent::event::proto::{DbgCommand, DbgEvent, ProtocolError, ReplyPayload};
use haltpoint::agent::patch::{PatchKind, PatchLocation, PatchRequest, PatchRole};
use serial_test::serial;
use std::sync::atomic::Ordering;

fn breakpoint_request(il: u32, version: Option<u32>) -> PatchRequest {
    PatchRequest {
        module: MODULE,
        method: METHOD_A,
        location: PatchLocation::Il(il),
        kind: PatchKind::Breakpoint,
        version: version.map(CodeVersion),
        instantiation_filter: None,
        all_instantiations: false,
    }
}

#[test]
#[serial]
fn test_basic_breakpoint_cycle() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();
    rig.peer.set_auto_continue(true);

    rig.agent
        .dispatch_command(DbgCommand::AddPatch(breakpoint_request(10, None)))
        .unwrap();
    let patch = match &rig.peer.replies()[1].result {
        Ok(ReplyPayload::PatchAdded { patch }) => *patch,
        other => panic!("unexpected reply: {other:?}"),
    };

    rig.publish(MODULE, METHOD_A, 1, &[(0, 0x100, true, false), (10, 0x110, true, false)]);
    let view = rig.agent.patches().get(patch).unwrap();
    assert_eq!(view.role, PatchRole::Bound);
    assert_eq!(view.bound_version, Some(CodeVersion(1)));
    assert_eq!(view.native_address, Some(0x110));

    let unsafe_before = rig.agent.suspension().threads_at_unsafe();
    rig.agent.on_breakpoint_hit(patch, T1).unwrap();

    // exactly one hit notification, then the stop confirmation
    let tags = rig.peer.notification_tags();
    assert_eq!(
        tags.iter().filter(|t| *t == "BreakpointHit").count(),
        1
    );
    assert_eq!(tags, vec!["BreakpointHit", "SyncComplete"]);

    // Running → Trapping → Stopped → Running, counters restored
    assert!(!rig.agent.suspension().is_suspended());
    assert_eq!(rig.suspender.suspend_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.suspender.resume_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.agent.suspension().threads_at_unsafe(), unsafe_before);
}

#[test]
#[serial]
fn test_hit_without_peer_is_dropped() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();

    let patch = rig.agent.add_patch(breakpoint_request(10, None)).unwrap();
    rig.publish(MODULE, METHOD_A, 1, &[(10, 0x110, true, false)]);

    rig.agent.on_breakpoint_hit(patch, T1).unwrap();
    assert!(rig.peer.notifications().is_empty());
    assert!(!rig.agent.suspension().is_suspended());
}

#[test]
#[serial]
fn test_duplicate_patch_rejected_through_command() {
    let rig = rig();
    rig.attach();

    rig.agent
        .dispatch_command(DbgCommand::AddPatch(breakpoint_request(10, Some(1))))
        .unwrap();
    rig.agent
        .dispatch_command(DbgCommand::AddPatch(breakpoint_request(10, Some(1))))
        .unwrap();

    let replies = rig.peer.replies();
    assert!(matches!(
        replies[1].result,
        Ok(ReplyPayload::PatchAdded { .. })
    ));
    assert!(matches!(
        replies[2].result,
        Err(ProtocolError::DuplicatePatch)
    ));
}

#[test]
#[serial]
fn test_same_breakpoint_against_two_versions_binds_twice() {
    let rig = rig();
    rig.attach();

    let at_v1 = rig.agent.add_patch(breakpoint_request(10, Some(1))).unwrap();
    let at_v2 = rig.agent.add_patch(breakpoint_request(10, Some(2))).unwrap();

    rig.publish(MODULE, METHOD_A, 1, &[(10, 0x1010, true, false)]);
    assert_eq!(
        rig.agent.patches().get(at_v1).unwrap().bound_version,
        Some(CodeVersion(1))
    );
    assert_eq!(rig.agent.patches().get(at_v2).unwrap().bound_version, None);

    rig.publish(MODULE, METHOD_A, 2, &[(10, 0x2010, true, false)]);
    let v2_view = rig.agent.patches().get(at_v2).unwrap();
    assert_eq!(v2_view.bound_version, Some(CodeVersion(2)));
    assert_eq!(v2_view.native_address, Some(0x2010));
}

#[test]
#[serial]
fn test_unbindable_patch_reports_failure_notification() {
    let rig = rig();
    rig.attach();

    // offset 99 is not a sequence point of the published body
    rig.agent.add_patch(breakpoint_request(99, Some(1))).unwrap();
    rig.agent.add_patch(breakpoint_request(10, Some(1))).unwrap();
    rig.publish(MODULE, METHOD_A, 1, &[(10, 0x1010, true, false)]);

    let failures: Vec<_> = rig
        .peer
        .notifications()
        .into_iter()
        .filter(|e| matches!(e, DbgEvent::PatchBindFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
}

#[test]
#[serial]
fn test_master_patch_covers_every_instantiation() {
    let rig = rig();
    rig.attach();

    let master = rig
        .agent
        .add_patch(PatchRequest {
            all_instantiations: true,
            ..breakpoint_request(10, Some(1))
        })
        .unwrap();

    rig.publish_instantiation(MODULE, METHOD_A, 1, Some(7), &[(10, 0x1010, true, false)]);
    rig.publish_instantiation(MODULE, METHOD_A, 1, Some(8), &[(10, 0x1010, true, false)]);

    let views = rig.agent.patches().find_all_for_method(MODULE, METHOD_A);
    let slaves: Vec<_> = views
        .iter()
        .filter(|v| v.role == (PatchRole::Slave { master }))
        .collect();
    assert_eq!(slaves.len(), 2);
    // the master itself never reached code
    assert!(
        rig.agent
            .patches()
            .get(master)
            .unwrap()
            .native_address
            .is_none()
    );
}
