//! Shared harness for the guest integration tests.
//!
//! Guests are written directly in wat. Real guests get their asyncify
//! machinery from the binaryen transform; these hand-rolled ones emulate
//! the same protocol with a program-counter global and a `br_table` resume
//! ladder: every section starts at an import call, so a rewound entry
//! re-executes exactly the call that suspended and nothing before it.

use capstan::stream::BufferOut;
use capstan::virt::paced::PacedDir;
use capstan::virt::MemDir;
use capstan::{Runner, WasiCtx, WasiCtxBuilder};
use std::sync::Arc;

/// Imports, linear memory, emulation globals, and the five asyncify hook
/// exports shared by every test guest.
pub const PRELUDE: &str = r#"
  (import "wasi_snapshot_preview1" "args_get" (func $args_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "args_sizes_get" (func $args_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_prestat_get" (func $fd_prestat_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_prestat_dir_name" (func $fd_prestat_dir_name (param i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "path_open" (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_seek" (func $fd_seek (param i32 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close" (func $fd_close (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_renumber" (func $fd_renumber (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_readdir" (func $fd_readdir (param i32 i32 i32 i64 i32) (result i32)))
  (import "wasi_snapshot_preview1" "poll_oneoff" (func $poll_oneoff (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (global $state (mut i32) (i32.const 0))
  (global $pc (mut i32) (i32.const 0))
  (global $ret (mut i32) (i32.const 0))
  (global $fd (mut i32) (i32.const 0))
  (global $saved (mut i32) (i32.const 0))
  (func (export "asyncify_get_state") (result i32) (global.get $state))
  (func (export "asyncify_start_unwind") (param i32) (global.set $state (i32.const 1)))
  (func (export "asyncify_stop_unwind") (global.set $state (i32.const 0)))
  (func (export "asyncify_start_rewind") (param i32) (global.set $state (i32.const 2)))
  (func (export "asyncify_stop_rewind") (global.set $state (i32.const 0)))
"#;

/// Wrap an import call: capture the errno, bail out of the export if the
/// host started an unwind, and exit with the errno if it was nonzero.
pub fn step(call: &str) -> String {
    format!(
        "(global.set $ret {call})\n\
         (if (i32.eq (global.get $state) (i32.const 1)) (then (return)))\n\
         (if (i32.ne (global.get $ret) (i32.const 0)) (then (call $proc_exit (global.get $ret))))"
    )
}

/// Like [`step`] but with caller-supplied handling after the unwind check.
pub fn step_raw(call: &str, post: &str) -> String {
    format!(
        "(global.set $ret {call})\n\
         (if (i32.eq (global.get $state) (i32.const 1)) (then (return)))\n\
         {post}"
    )
}

/// Build the resume ladder. `sections[0]` runs only on a fresh entry;
/// every other section begins with the import call whose suspension
/// resumes there. The program counter is bumped between sections.
pub fn ladder(sections: &[String]) -> String {
    let n = sections.len();
    assert!(n >= 1);
    let labels: Vec<String> = (0..n).map(|i| format!("$s{i}")).collect();
    let mut acc = format!(
        "(block $s0 (br_table {} (global.get $pc)))",
        labels.join(" ")
    );
    for i in 1..n {
        acc = format!(
            "(block $s{i}\n{acc}\n{}\n(global.set $pc (i32.const {i}))\n)",
            sections[i - 1]
        );
    }
    format!("{acc}\n{}", sections[n - 1])
}

/// A whole `_start` module: prelude, data segments, ladder body.
pub fn start_module(data: &str, sections: &[String]) -> String {
    format!(
        "(module\n{PRELUDE}\n{data}\n(func (export \"_start\")\n{}\n)\n)",
        ladder(sections)
    )
}

/// The standard sandbox fixture used across scenarios.
pub fn sandbox() -> Arc<MemDir> {
    let root = MemDir::new();
    root.put_file("input.txt", b"hello from input.txt\n").unwrap();
    root.put_file("input2.txt", b"hello from input2.txt\n").unwrap();
    root
}

pub fn builder_with(sandbox: Arc<MemDir>, stdout: &BufferOut, paced: bool) -> WasiCtxBuilder {
    let dir: Arc<dyn capstan::fs::DirHandle> = if paced {
        Arc::new(PacedDir(sandbox))
    } else {
        sandbox
    };
    WasiCtx::builder()
        .preopened_dir("/sandbox", dir)
        .stdout(stdout.clone())
}

/// Run a wat guest against the standard sandbox; returns the driver result
/// and captured stdout.
pub async fn run_guest(
    wat_src: &str,
    paced: bool,
    configure: impl FnOnce(WasiCtxBuilder) -> WasiCtxBuilder,
) -> (anyhow::Result<i32>, BufferOut) {
    let stdout = BufferOut::new();
    let builder = configure(builder_with(sandbox(), &stdout, paced));
    let result = Runner::new(builder.build()).run(wat_src.as_bytes()).await;
    (result, stdout)
}
