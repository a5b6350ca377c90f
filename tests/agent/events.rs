use crate::common::rig;
use crate::{METHOD_A, MODULE, T1};
use haltpoint::agent::code::CodeVersion;
use haltpoint::agent::error::Error;
use haltpoint::agent::event::proto::{DbgCommand, DbgEvent, DebugFlags, ProtocolError, ReplyPayload};
use haltpoint::agent::exception::ExceptionId;
use serial_test::serial;

#[test]
#[serial]
fn test_first_chance_notifies_without_stopping_by_default() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();

    rig.agent
        .on_exception_first_chance(T1, ExceptionId(1))
        .unwrap();
    assert_eq!(rig.peer.notification_tags(), vec!["ExceptionFirstChance"]);
    assert!(!rig.agent.suspension().is_suspended());

    // the same instance must not fire first-chance twice
    assert!(matches!(
        rig.agent.on_exception_first_chance(T1, ExceptionId(1)),
        Err(Error::ExceptionPhase(_, _))
    ));
}

#[test]
#[serial]
fn test_stop_on_first_chance_flag_runs_full_cycle() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();
    rig.peer.set_auto_continue(true);

    rig.agent
        .dispatch_command(DbgCommand::SetDebugFlags(DebugFlags {
            report_log_messages: true,
            stop_on_first_chance: true,
        }))
        .unwrap();

    rig.agent
        .on_exception_first_chance(T1, ExceptionId(2))
        .unwrap();
    assert_eq!(
        rig.peer.notification_tags(),
        vec!["ExceptionFirstChance", "SyncComplete"]
    );
    assert!(!rig.agent.suspension().is_suspended());
}

#[test]
#[serial]
fn test_terminal_exception_phases_exclusive_across_call_ins() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();

    let exception = ExceptionId(3);
    rig.agent
        .on_exception_catch_handler_found(T1, exception)
        .unwrap();
    assert!(matches!(
        rig.agent.on_exception_unwind_begin(T1, exception),
        Err(Error::ExceptionPhase(_, _))
    ));
    assert!(matches!(
        rig.agent.on_exception_unhandled(T1, exception),
        Err(Error::ExceptionPhase(_, _))
    ));

    // no event went out for the rejected phases
    assert_eq!(
        rig.peer.notification_tags(),
        vec!["ExceptionCatchHandlerFound"]
    );
}

#[test]
#[serial]
fn test_log_messages_follow_the_report_flag() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();

    rig.agent.on_log_message(T1, 1, "app", "hello").unwrap();
    assert_eq!(rig.peer.notification_tags(), vec!["LogMessage"]);

    rig.agent
        .dispatch_command(DbgCommand::SetDebugFlags(DebugFlags {
            report_log_messages: false,
            stop_on_first_chance: false,
        }))
        .unwrap();
    rig.agent.on_log_message(T1, 1, "app", "silent").unwrap();
    assert_eq!(rig.peer.notification_tags(), vec!["LogMessage"]);
}

#[test]
#[serial]
fn test_func_eval_lifecycle() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();
    rig.peer.set_auto_continue(true);

    rig.agent
        .dispatch_command(DbgCommand::FuncEvalSetup { thread: T1 })
        .unwrap();
    let eval = match &rig.peer.replies()[1].result {
        Ok(ReplyPayload::EvalPrepared { eval }) => *eval,
        other => panic!("unexpected reply: {other:?}"),
    };

    rig.agent
        .dispatch_command(DbgCommand::FuncEvalAbort { eval })
        .unwrap();
    assert!(rig.peer.replies()[2].result.is_ok());

    rig.agent.on_func_eval_complete(eval, T1).unwrap();
    assert!(
        rig.peer
            .notifications()
            .iter()
            .any(|e| matches!(e, DbgEvent::FuncEvalComplete { .. }))
    );

    // the record is gone
    assert!(matches!(
        rig.agent.on_func_eval_complete(eval, T1),
        Err(Error::UnknownEvalHandle(_))
    ));
}

#[test]
#[serial]
fn test_set_instruction_pointer_validated_by_mapper() {
    let rig = rig();
    rig.agent.on_thread_created(T1).unwrap();
    rig.attach();
    rig.publish(MODULE, METHOD_A, 1, &[(10, 0x110, true, false)]);

    rig.agent
        .dispatch_command(DbgCommand::SetInstructionPointer {
            thread: T1,
            module: MODULE,
            method: METHOD_A,
            il_offset: 10,
        })
        .unwrap();
    assert!(rig.peer.replies()[1].result.is_ok());
    let redirect = rig.agent.take_pending_redirect(T1).unwrap();
    assert_eq!(redirect.native_offset, 0x110);
    assert_eq!(redirect.version, CodeVersion(1));

    // an offset outside the sequence-point table is a typed protocol error
    rig.agent
        .dispatch_command(DbgCommand::SetInstructionPointer {
            thread: T1,
            module: MODULE,
            method: METHOD_A,
            il_offset: 999,
        })
        .unwrap();
    assert!(matches!(
        rig.peer.replies()[2].result,
        Err(ProtocolError::OffsetUnmapped)
    ));
}

#[test]
#[serial]
fn test_thread_lifecycle_events() {
    let rig = rig();
    rig.attach();
    rig.peer.set_auto_continue(true);

    rig.agent.on_thread_created(T1).unwrap();
    assert_eq!(
        rig.peer.notification_tags(),
        vec!["ThreadCreated", "SyncComplete"]
    );

    rig.agent.on_thread_exited(T1).unwrap();
    let tags = rig.peer.notification_tags();
    assert_eq!(tags.last().map(String::as_str), Some("ThreadExited"));
    assert!(!rig.agent.suspension().is_suspended());
}
