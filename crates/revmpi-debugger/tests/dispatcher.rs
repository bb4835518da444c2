// Once clippy takes `clippy.toml` into account (for `tests` targets),
// we can remove these.
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::Command as Gcc;

use revmpi_debugger::checkpoint::{self, CheckpointEngine, CheckpointMode, MemoryRegion};
use revmpi_debugger::{
    BreakpointKind, DebuggerConfig, Dispatcher, MessageEventInterceptor, ProcessContext, ProcessState, StopEvent,
    WorkerSession,
};
use revmpi_proto::{Command, CommandResult, InternalTopic, OperationRecord, WorkerId, ops};
use revmpi_symbol::DebugModel;
use tokio::sync::mpsc;

const WRAPPER: &str = indoc::indoc! {r#"
    void _MPI_WRAPPER_INCLUDE() {}

    int _MPI_WRAPPER_PROC_RANK = 2;

    int _MPI_Send(int dest, int tag)
    {
        int code = dest + tag;
        return code;
    }

    int _MPI_Recv(int source, int tag)
    {
        int code = source - tag;
        return code;
    }
"#};

/// Wrapper forking a paused image of the process at each operation.
const FORK_WRAPPER: &str = indoc::indoc! {r#"
    #include <signal.h>
    #include <unistd.h>

    void _MPI_WRAPPER_INCLUDE() {}

    int _MPI_WRAPPER_PROC_RANK = 2;

    int _MPI_CHECKPOINT_CHILD;

    void _MPI_WRAPPER_RECORD()
    {
        _MPI_CHECKPOINT_CHILD = fork();
        if (_MPI_CHECKPOINT_CHILD == 0)
        {
            sigset_t set;
            sigemptyset(&set);
            sigsuspend(&set);
            _exit(0);
        }
    }

    int _MPI_Send(int dest, int tag)
    {
        _MPI_WRAPPER_RECORD();
        int code = dest + tag;
        return code;
    }

    int _MPI_Recv(int source, int tag)
    {
        _MPI_WRAPPER_RECORD();
        int code = source - tag;
        return code;
    }
"#};

const TARGET: &str = indoc::indoc! {r#"
    #include "wrap.h"

    int global_total = 0;

    int main(void) {
        int counter = 3;
        global_total = _MPI_Send(1, counter);
        // nothing here
        for (int i = 0; i < 3; i++) {
            global_total += 10;
        }
        global_total += _MPI_Recv(0, counter);
        counter = 7;
        return 0;
    }
"#};

const LOOP_BODY_LINE: i64 = 10;
const COMMENT_LINE: i64 = 8;
const LAST_ASSIGN_LINE: i64 = 13;

fn compile(dir: &Path) -> PathBuf {
    compile_with(dir, WRAPPER)
}

fn compile_with(dir: &Path, wrapper: &str) -> PathBuf {
    std::fs::write(dir.join("wrap.h"), wrapper).expect("write wrap.h");
    std::fs::write(dir.join("target.c"), TARGET).expect("write target.c");

    let out = dir.join("target");

    let gcc = Gcc::new("gcc")
        .args(["-g", "-O0", "-fno-omit-frame-pointer"])
        .arg(dir.join("target.c"))
        .arg("-o")
        .arg(&out)
        .output()
        .expect("gcc");

    if !gcc.status.success() {
        panic!("{}", String::from_utf8_lossy(&gcc.stderr));
    }

    out
}

struct Fixture {
    _dir: tempfile::TempDir,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedReceiver<OperationRecord>,
}

impl Fixture {
    fn launch(mode: CheckpointMode) -> Self {
        Self::launch_with(WRAPPER, mode)
    }

    fn launch_with(wrapper: &str, mode: CheckpointMode) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let binary = compile_with(dir.path(), wrapper);

        let config = DebuggerConfig {
            checkpoint_mode: mode,
            checkpoint_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let (tx, events) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::launch(&binary, &[], &config, Box::new(tx)).expect("launch");

        Self {
            _dir: dir,
            dispatcher,
            events,
        }
    }

    fn apply(&mut self, command: Command) -> CommandResult {
        self.dispatcher.apply(&command).expect("fatal error")
    }

    fn print(&mut self, var: &str) -> String {
        let res = self.apply(Command::Print {
            variable: var.to_owned(),
        });
        assert_eq!(res.error, None);
        res.output.expect("output")
    }

    fn drain_events(&mut self) -> Vec<OperationRecord> {
        let mut records = Vec::new();
        while let Ok(record) = self.events.try_recv() {
            records.push(record);
        }
        records
    }
}

#[test_log::test]
fn message_breakpoints_are_armed_at_launch() {
    let fx = Fixture::launch(CheckpointMode::Snapshot);

    let bks = fx.dispatcher.process().breakpoints();
    assert_eq!(bks.len(), 2);
    assert!(bks.sorted().iter().all(|bk| bk.is_message_event()));
    assert!(fx.dispatcher.entry_file().ends_with("target.c"));
}

#[test_log::test]
fn continue_records_message_event_before_user_breakpoint() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    let res = fx.apply(Command::SetBreakpoint {
        line: LOOP_BODY_LINE,
    });
    assert_eq!(res.error, None);
    assert_eq!(fx.dispatcher.process().breakpoints().len(), 3);

    let res = fx.apply(Command::Continue);
    assert_eq!(res.error, None);
    assert!(!res.exited);
    assert!(res.output.expect("location").starts_with("line 10 "));

    assert_eq!(fx.dispatcher.checkpoints().checkpoints().len(), 1);

    let records = fx.drain_events();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op_name, ops::MPI_SEND);
    assert_eq!(records[0].integer_param(ops::param::DEST), Some(1));
    assert_eq!(records[0].integer_param(ops::param::TAG), Some(3));
    assert_eq!(records[0].integer_param(ops::param::RANK), Some(2));
    assert_eq!(
        &records[0].checkpoint_id,
        &fx.dispatcher.checkpoints().checkpoints()[0].id
    );

    // user breakpoints are one-shot
    assert_eq!(fx.dispatcher.process().breakpoints().len(), 2);

    assert_eq!(fx.dispatcher.stack().len(), 1);
    assert_eq!(fx.dispatcher.stack()[0].name, "main");

    assert!(fx.print("counter").ends_with("= 3"));
    assert!(fx.print("global_total").ends_with("= 4"));
}

#[test_log::test]
fn line_without_statement_is_rejected() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    let res = fx.apply(Command::SetBreakpoint { line: COMMENT_LINE });
    assert!(res.error.is_some());
    assert!(!res.exited);
    assert_eq!(fx.dispatcher.process().breakpoints().len(), 2);

    let res = fx.apply(Command::SetBreakpoint {
        line: LOOP_BODY_LINE,
    });
    assert_eq!(res.error, None);

    let res = fx.apply(Command::SetBreakpoint {
        line: LOOP_BODY_LINE,
    });
    assert!(res.error.is_some());
    assert_eq!(fx.dispatcher.process().breakpoints().len(), 3);
}

#[test_log::test]
fn negative_line_skips_first_hit() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    let res = fx.apply(Command::SetBreakpoint {
        line: -LOOP_BODY_LINE,
    });
    assert_eq!(res.error, None);

    let res = fx.apply(Command::Continue);
    assert_eq!(res.error, None);

    // second loop iteration
    assert!(fx.print("global_total").ends_with("= 14"));
}

#[test_log::test]
fn run_to_exit_rejects_further_commands() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    let res = fx.apply(Command::Continue);
    assert_eq!(res.error, None);
    assert!(res.exited);
    assert_eq!(fx.dispatcher.process().state(), ProcessState::Exited(0));

    let ops = fx
        .drain_events()
        .into_iter()
        .map(|r| r.op_name)
        .collect::<Vec<_>>();
    assert_eq!(ops, vec![ops::MPI_SEND, ops::MPI_RECV]);
    assert_eq!(fx.dispatcher.checkpoints().checkpoints().len(), 2);

    let res = fx.apply(Command::SingleStep);
    assert!(res.error.is_some());
    assert!(res.exited);

    let res = fx.apply(Command::SetBreakpoint {
        line: LOOP_BODY_LINE,
    });
    assert!(res.error.is_some());
    assert!(res.exited);
}

#[test_log::test]
fn single_step_advances_one_instruction() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    fx.apply(Command::SetBreakpoint {
        line: LOOP_BODY_LINE,
    });
    fx.apply(Command::Continue);

    let before = fx.dispatcher.process().registers().unwrap().instr_addr();

    let res = fx.apply(Command::SingleStep);
    assert_eq!(res.error, None);
    assert!(!res.exited);

    let after = fx.dispatcher.process().registers().unwrap().instr_addr();
    assert_ne!(before, after);
}

#[test_log::test]
fn restore_rewinds_memory_and_breakpoints() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    fx.apply(Command::SetBreakpoint {
        line: LAST_ASSIGN_LINE,
    });

    let res = fx.apply(Command::Continue);
    assert!(res.output.expect("location").starts_with("line 13 "));
    assert!(fx.print("global_total").ends_with("= 31"));

    let records = fx.drain_events();
    assert_eq!(records.len(), 2);

    let send_cp = records[0].checkpoint_id.clone();

    let res = fx.apply(Command::Restore {
        checkpoint: send_cp.clone(),
    });
    assert_eq!(res.error, None);
    let first_loc = res.output.expect("location");

    assert_eq!(fx.dispatcher.checkpoints().checkpoints().len(), 1);
    assert!(fx.print("global_total").ends_with("= 0"));
    assert_eq!(fx.dispatcher.stack()[0].name, "_MPI_Send");

    // restoring the same checkpoint twice lands in the same state
    let res = fx.apply(Command::Restore {
        checkpoint: send_cp,
    });
    assert_eq!(res.output.expect("location"), first_loc);

    // the user breakpoint captured with the checkpoint is armed again
    let res = fx.apply(Command::Continue);
    assert_eq!(res.error, None);
    assert!(res.output.expect("location").starts_with("line 13 "));
    assert!(fx.print("global_total").ends_with("= 31"));

    let records = fx.drain_events();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op_name, ops::MPI_RECV);
    assert_eq!(fx.dispatcher.checkpoints().checkpoints().len(), 2);
}

#[test_log::test]
fn unknown_checkpoint_is_not_fatal() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    let res = fx.apply(Command::Restore {
        checkpoint: "nosuchcp00".into(),
    });
    assert!(res.error.is_some_and(|e| e.contains("nosuchcp00")));
    assert!(!res.exited);
}

#[test_log::test]
fn unknown_variable_is_not_fatal() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    let res = fx.apply(Command::Print {
        variable: "does_not_exist".to_owned(),
    });
    assert!(res.error.is_some());
}

#[test_log::test]
fn internal_state_dumps() {
    let mut fx = Fixture::launch(CheckpointMode::Snapshot);

    fx.apply(Command::SetBreakpoint {
        line: LOOP_BODY_LINE,
    });
    fx.apply(Command::Continue);

    let maps = fx.apply(Command::PrintInternal {
        topic: InternalTopic::Maps,
    });
    assert!(maps.output.expect("maps").contains("[stack]"));

    let cps = fx.apply(Command::PrintInternal {
        topic: InternalTopic::Checkpoints,
    });
    let cps = cps.output.expect("checkpoints");
    assert!(cps.starts_with("store: snapshot"));
    assert!(cps.contains(ops::MPI_SEND));

    let last = fx.apply(Command::PrintInternal {
        topic: InternalTopic::Last,
    });
    assert!(last.output.expect("stack").contains("main"));
}

#[test_log::test]
fn fork_mode_falls_back_without_wrapper_support() {
    let fx = Fixture::launch(CheckpointMode::Fork);

    assert_eq!(fx.dispatcher.checkpoints().store_name(), "snapshot");
}

#[test_log::test]
fn fork_store_retains_images_forked_by_the_wrapper() {
    let mut fx = Fixture::launch_with(FORK_WRAPPER, CheckpointMode::Fork);

    assert_eq!(fx.dispatcher.checkpoints().store_name(), "fork");
    // the record helper is not an operation
    assert_eq!(fx.dispatcher.process().breakpoints().len(), 2);

    fx.apply(Command::SetBreakpoint {
        line: LAST_ASSIGN_LINE,
    });

    let res = fx.apply(Command::Continue);
    assert_eq!(res.error, None);
    assert!(res.output.expect("location").starts_with("line 13 "));
    assert!(fx.print("global_total").ends_with("= 31"));

    let records = fx.drain_events();
    assert_eq!(
        records.iter().map(|r| r.op_name.as_str()).collect::<Vec<_>>(),
        vec![ops::MPI_SEND, ops::MPI_RECV]
    );
    assert_eq!(records[0].integer_param(ops::param::DEST), Some(1));
    assert_eq!(records[0].integer_param(ops::param::TAG), Some(3));

    // forked images only copy the stack
    let cps = fx.dispatcher.checkpoints().checkpoints();
    assert_eq!(cps.len(), 2);
    assert!(
        cps.iter()
            .all(|cp| cp.regions().iter().all(|region| region.ident == "[stack]"))
    );

    let res = fx.apply(Command::Restore {
        checkpoint: records[0].checkpoint_id.clone(),
    });
    assert_eq!(res.error, None);
    assert_eq!(fx.dispatcher.checkpoints().checkpoints().len(), 1);
    assert!(fx.print("global_total").ends_with("= 0"));
    assert_eq!(fx.dispatcher.stack()[0].name, "_MPI_Send");

    let res = fx.apply(Command::Continue);
    assert_eq!(res.error, None);
    assert!(res.output.expect("location").starts_with("line 13 "));
    assert!(fx.print("global_total").ends_with("= 31"));

    let records = fx.drain_events();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op_name, ops::MPI_RECV);
    assert_eq!(fx.dispatcher.checkpoints().checkpoints().len(), 2);
}

#[test_log::test]
fn fork_mode_snapshots_operations_without_fork() {
    // the plain wrapper defines no record helper, the child variable is
    // added so that the fork store is selected
    let wrapper = format!("int _MPI_CHECKPOINT_CHILD;\n{WRAPPER}");
    let mut fx = Fixture::launch_with(&wrapper, CheckpointMode::Fork);
    assert_eq!(fx.dispatcher.checkpoints().store_name(), "fork");

    let res = fx.apply(Command::Continue);
    assert_eq!(res.error, None);
    assert!(res.exited);

    assert_eq!(fx.drain_events().len(), 2);

    let cps = fx.dispatcher.checkpoints().checkpoints();
    assert_eq!(cps.len(), 2);
    assert!(
        cps.iter()
            .all(|cp| cp.regions().iter().any(|region| region.ident != "[stack]"))
    );
}

#[test_log::test]
fn breakpoint_hit_puts_original_instruction_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = compile(dir.path());

    let model = DebugModel::parse(&binary).expect("parse");
    let file = model.entry_source_file("main").expect("main file").to_owned();

    let mut process = ProcessContext::start(&binary, &[], model.is_pie()).expect("start");

    let addr = process.to_runtime(
        model
            .line_to_address(&file, LOOP_BODY_LINE as u64)
            .expect("loop body"),
    );
    let original = process.peek_memory(addr, 1).expect("peek");

    process
        .insert_breakpoint(addr, BreakpointKind::User)
        .expect("breakpoint");
    assert_ne!(process.peek_memory(addr, 1).expect("peek"), original);

    assert_eq!(process.continue_execution(false).expect("continue"), StopEvent::Trap);

    let bk = process
        .restore_at_current_stop()
        .expect("restore")
        .expect("breakpoint hit");
    assert_eq!(bk.addr, addr);

    assert_eq!(process.peek_memory(addr, 1).expect("peek"), original);
    assert_eq!(process.registers().expect("registers").instr_addr(), addr);
    assert!(process.breakpoints().get(addr).is_none());

    // a stop which is not a breakpoint hit has nothing to restore
    assert_eq!(process.continue_execution(true).expect("step"), StopEvent::Trap);
    assert!(process.restore_at_current_stop().expect("restore").is_none());
}

fn read_regions(process: &ProcessContext, regions: &[MemoryRegion]) -> Vec<Vec<u8>> {
    regions
        .iter()
        .map(|region| {
            process
                .peek_memory(region.range.start, region.len())
                .expect("peek region")
        })
        .collect()
}

fn writable_regions(process: &ProcessContext) -> Vec<MemoryRegion> {
    let target = process.target().to_string_lossy().into_owned();

    process
        .memory_maps()
        .expect("maps")
        .into_iter()
        .filter(|map| map.perms.contains('w'))
        .filter_map(|map| {
            let ident = map.ident?;
            (ident == target || ident == "[stack]" || ident == "[heap]").then_some(MemoryRegion {
                range: map.range,
                ident,
            })
        })
        .collect()
}

/// Stops the fork-wrapped target one instruction into `_MPI_Send`, takes a
/// checkpoint and restores it at once.
fn assert_restore_after_create_is_identity(mode: CheckpointMode, expected_store: &str) {
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = compile_with(dir.path(), FORK_WRAPPER);

    let model = DebugModel::parse(&binary).expect("parse");
    let mut process = ProcessContext::start(&binary, &[], model.is_pie()).expect("start");

    let interceptor = MessageEventInterceptor::new(&model, &process);
    let send = interceptor
        .breakpoints()
        .iter()
        .find(|bk| bk.op_name == ops::MPI_SEND)
        .expect("send breakpoint")
        .addr;

    process
        .insert_breakpoint(send, BreakpointKind::User)
        .expect("breakpoint");
    assert_eq!(process.continue_execution(false).expect("continue"), StopEvent::Trap);
    assert!(process.restore_at_current_stop().expect("restore").is_some());
    assert_eq!(process.continue_execution(true).expect("step"), StopEvent::Trap);

    let store = checkpoint::open_store(mode, dir.path(), &model, process.target());
    let mut engine = CheckpointEngine::new(store);
    assert_eq!(engine.store_name(), expected_store);

    engine
        .prepare(&mut process, &model, ops::MPI_SEND)
        .expect("prepare");
    let id = engine
        .create(&process, &model, ops::MPI_SEND)
        .expect("create");

    let captured = engine.get(&id).expect("checkpoint").regions().to_vec();
    assert!(!captured.is_empty());

    if mode == CheckpointMode::Fork {
        assert!(captured.iter().all(|region| region.ident == "[stack]"));
    }

    let writable = writable_regions(&process);

    let registers = process.registers().expect("registers");
    let captured_bytes = read_regions(&process, &captured);
    let writable_bytes = read_regions(&process, &writable);

    engine.restore(&mut process, &id, &[]).expect("restore");

    assert!(process.registers().expect("registers") == registers);
    assert_eq!(read_regions(&process, &captured), captured_bytes);
    assert_eq!(read_regions(&process, &writable), writable_bytes);
}

#[test_log::test]
fn snapshot_restore_after_create_is_identity() {
    assert_restore_after_create_is_identity(CheckpointMode::Snapshot, "snapshot");
}

#[test_log::test]
fn fork_restore_after_create_is_identity() {
    assert_restore_after_create_is_identity(CheckpointMode::Fork, "fork");
}

#[test_log::test(tokio::test)]
async fn session_reports_worker_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = compile(dir.path());

    let config = DebuggerConfig {
        checkpoint_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let (tx, mut events) = mpsc::unbounded_channel();

    let mut session = WorkerSession::launch(binary, Vec::new(), config, Box::new(tx))
        .await
        .expect("launch");
    assert_ne!(session.pid(), 0);

    session.set_worker_id(WorkerId(4)).await.expect("worker id");

    let res = session.apply(Command::Continue).await.expect("continue");
    assert!(res.exited);

    let record = events.recv().await.expect("record");
    assert_eq!(record.worker_id, WorkerId(4));
    assert_eq!(record.op_name, ops::MPI_SEND);

    let res = session.apply(Command::Quit).await.expect("quit");
    assert!(res.exited);
}
