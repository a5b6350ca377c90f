use crate::common::rig;
use crate::{METHOD_A, METHOD_B, MODULE, T1};
use haltpoint::agent::code::CodeVersion;
use haltpoint::agent::event::proto::{DbgCommand, DbgEvent, ReplyPayload};
use haltpoint::agent::patch::{PatchKind, PatchLocation, PatchRequest, RebindPass};
use serial_test::serial;

#[test]
#[serial]
fn test_code_edit_reserves_next_version() {
    let rig = rig();
    rig.attach();
    rig.publish(MODULE, METHOD_A, 1, &[(0, 0x100, true, false)]);

    rig.agent
        .dispatch_command(DbgCommand::ApplyCodeEdit {
            module: MODULE,
            method: METHOD_A,
        })
        .unwrap();
    let version = match &rig.peer.replies()[1].result {
        Ok(ReplyPayload::CodeEditApplied { version }) => *version,
        other => panic!("unexpected reply: {other:?}"),
    };
    assert_eq!(version, CodeVersion(2));
}

#[test]
#[serial]
fn test_publishing_an_edit_seeds_remap_traps_on_old_version() {
    let rig = rig();
    rig.attach();

    // v1 has two remappable points, one mid-expression, one inside a handler
    rig.publish(
        MODULE,
        METHOD_A,
        1,
        &[
            (0, 0x100, true, false),
            (4, 0x104, false, false),
            (10, 0x110, true, false),
            (20, 0x120, true, true),
        ],
    );
    assert!(rig.agent.patches().list().is_empty());

    rig.publish(MODULE, METHOD_A, 2, &[(0, 0x200, true, false), (10, 0x210, true, false)]);

    let traps: Vec<_> = rig
        .agent
        .patches()
        .list()
        .into_iter()
        .filter(|p| p.kind == PatchKind::EncRemapPending)
        .collect();
    assert_eq!(traps.len(), 2);
    assert!(traps.iter().all(|t| t.version == CodeVersion(1)));
    assert!(
        traps
            .iter()
            .any(|t| t.location == PatchLocation::Il(0) && t.native_address == Some(0x100))
    );
    assert!(
        traps
            .iter()
            .any(|t| t.location == PatchLocation::Il(10) && t.native_address == Some(0x110))
    );
}

#[test]
#[serial]
fn test_remap_opportunity_round_trip() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();

    rig.publish(MODULE, METHOD_A, 1, &[(10, 0x110, true, false)]);
    rig.publish(MODULE, METHOD_A, 2, &[(10, 0x210, true, false)]);

    let trap = rig
        .agent
        .patches()
        .list()
        .into_iter()
        .find(|p| p.kind == PatchKind::EncRemapPending)
        .expect("trap seeded");

    // the peer accepts the remap, then continues
    rig.peer.push_command(DbgCommand::RemapRedirect {
        patch: trap.number,
        thread: T1,
        il_offset: 10,
    });
    rig.peer.set_auto_continue(true);

    rig.agent.on_breakpoint_hit(trap.number, T1).unwrap();

    let opportunity = rig
        .peer
        .notifications()
        .into_iter()
        .find_map(|e| match e {
            DbgEvent::RemapOpportunity {
                old_version,
                new_version,
                il_offset,
                ..
            } => Some((old_version, new_version, il_offset)),
            _ => None,
        })
        .expect("remap opportunity sent");
    assert_eq!(opportunity, (CodeVersion(1), CodeVersion(2), 10));

    // the accepted redirect is waiting for the host at resume
    let redirect = rig.agent.take_pending_redirect(T1).expect("redirect recorded");
    assert_eq!(redirect.version, CodeVersion(2));
    assert_eq!(redirect.il_offset, 10);
    assert_eq!(redirect.native_offset, 0x210);

    // the trap became a completion marker at the landing point
    let marker = rig.agent.patches().get(trap.number).unwrap();
    assert_eq!(marker.kind, PatchKind::EncRemapComplete);
    assert_eq!(marker.version, CodeVersion(2));

    assert!(!rig.agent.suspension().is_suspended());
}

// Pins inherited behavior flagged in the rebind design: the dedup set is
// scoped to the whole pass, so two unrelated methods rebound in one pass
// must not collide in it (handles are table-unique).
#[test]
#[serial]
fn test_pass_spanning_two_methods_binds_both() {
    let rig = rig();
    rig.attach();

    let on_a = rig
        .agent
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
    let on_b = rig
        .agent
        .add_patch(PatchRequest {
            module: MODULE,
            method: METHOD_B,
            location: PatchLocation::Il(10),
            kind: PatchKind::Breakpoint,
            version: Some(CodeVersion(1)),
            instantiation_filter: None,
            all_instantiations: false,
        })
        .unwrap();

    rig.mapper.allow(MODULE, METHOD_A, CodeVersion(1), 10, 0xa10);
    rig.mapper.allow(MODULE, METHOD_B, CodeVersion(1), 10, 0xb10);

    let mut pass = RebindPass::new();
    let body_a = haltpoint::agent::code::CompiledBody {
        version: CodeVersion(1),
        instantiation: None,
        sequence_points: vec![],
    };
    let bound_a = rig.agent.patches().rebind_after_code_version(
        &mut pass,
        MODULE,
        METHOD_A,
        &body_a,
        &*rig.mapper,
        |_| {},
    );
    let body_b = haltpoint::agent::code::CompiledBody {
        version: CodeVersion(1),
        instantiation: None,
        sequence_points: vec![],
    };
    let bound_b = rig.agent.patches().rebind_after_code_version(
        &mut pass,
        MODULE,
        METHOD_B,
        &body_b,
        &*rig.mapper,
        |_| {},
    );

    assert_eq!(bound_a.iter().map(|v| v.number).collect::<Vec<_>>(), vec![on_a]);
    assert_eq!(bound_b.iter().map(|v| v.number).collect::<Vec<_>>(), vec![on_b]);
}
