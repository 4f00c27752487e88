//! Negative scenarios and descriptor-lifecycle invariants, driven from
//! guests that report errnos through their exit status.

mod common;

use capstan::{AbortToken, Errno, I32Exit};
use common::{run_guest, start_module, step, step_raw};

const DATA: &str = r#"
  (data (i32.const 2048) "input.txt")
  (data (i32.const 2064) "missing.txt")
"#;

/// `path_open` wrapper that exits with whatever errno came back.
fn open_expecting_errno(path_ptr: u32, path_len: u32, oflags: u32, fdflags: u32) -> String {
    step_raw(
        &format!(
            "(call $path_open (i32.const 3) (i32.const 0) (i32.const {path_ptr}) (i32.const {path_len}) \
             (i32.const {oflags}) (i64.const 0) (i64.const 0) (i32.const {fdflags}) (i32.const 2100))"
        ),
        "(call $proc_exit (global.get $ret))",
    )
}

#[test_log::test(tokio::test)]
async fn open_missing_without_create_is_noent() {
    let guest = start_module(
        DATA,
        &[String::new(), open_expecting_errno(2064, 11, 0, 0)],
    );
    for paced in [false, true] {
        let (status, _) = run_guest(&guest, paced, |b| b).await;
        assert_eq!(status.unwrap(), Errno::Noent.raw() as i32);
    }
}

#[test_log::test(tokio::test)]
async fn open_file_as_directory_is_notdir() {
    // oflags DIRECTORY = 2, against a regular file
    let guest = start_module(
        DATA,
        &[String::new(), open_expecting_errno(2048, 9, 2, 0)],
    );
    let (status, _) = run_guest(&guest, false, |b| b).await;
    assert_eq!(status.unwrap(), Errno::Notdir.raw() as i32);
}

#[test_log::test(tokio::test)]
async fn open_with_exotic_fdflags_is_nosys() {
    // fdflags APPEND = 1 is not hosted
    let guest = start_module(
        DATA,
        &[String::new(), open_expecting_errno(2048, 9, 0, 1)],
    );
    let (status, _) = run_guest(&guest, false, |b| b).await;
    assert_eq!(status.unwrap(), Errno::Nosys.raw() as i32);
}

#[test_log::test(tokio::test)]
async fn nonblock_fdflag_is_cleared_not_rejected() {
    // fdflags NONBLOCK = 4 is dropped with a warning; the open succeeds
    let guest = start_module(
        DATA,
        &[
            String::new(),
            step(
                "(call $path_open (i32.const 3) (i32.const 0) (i32.const 2048) (i32.const 9) \
                 (i32.const 0) (i64.const 0) (i64.const 0) (i32.const 4) (i32.const 2100))",
            ),
        ],
    );
    let (status, _) = run_guest(&guest, false, |b| b).await;
    assert_eq!(status.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn escaping_path_is_notcapable() {
    let escape = r#"(data (i32.const 2048) "../etc/passwd")"#;
    let guest = start_module(
        escape,
        &[String::new(), open_expecting_errno(2048, 13, 0, 0)],
    );
    let (status, _) = run_guest(&guest, false, |b| b).await;
    assert_eq!(status.unwrap(), Errno::Notcapable.raw() as i32);
}

#[test_log::test(tokio::test)]
async fn poll_with_zero_subscriptions_traps() {
    let guest = start_module(
        DATA,
        &[
            String::new(),
            step("(call $poll_oneoff (i32.const 2200) (i32.const 2300) (i32.const 0) (i32.const 2104))"),
        ],
    );
    let (status, _) = run_guest(&guest, false, |b| b).await;
    let err = status.unwrap_err();
    // a host precondition violation, not an exit and not an errno
    assert!(err.downcast_ref::<I32Exit>().is_none());
    assert!(format!("{err:#}").contains("at least one subscription"));
}

#[test_log::test(tokio::test)]
async fn abort_during_clock_wait_is_canceled() {
    // a ten-second subscription; the host fires the abort token instead
    let guest = start_module(
        DATA,
        &[
            "(i64.store (i32.const 2200) (i64.const 1))\n\
             (i32.store8 (i32.const 2208) (i32.const 0))\n\
             (i32.store (i32.const 2216) (i32.const 1))\n\
             (i64.store (i32.const 2224) (i64.const 10000000000))\n\
             (i64.store (i32.const 2232) (i64.const 0))\n\
             (i32.store16 (i32.const 2240) (i32.const 0))"
                .to_string(),
            step_raw(
                "(call $poll_oneoff (i32.const 2200) (i32.const 2300) (i32.const 1) (i32.const 2104))",
                "(call $proc_exit (global.get $ret))",
            ),
        ],
    );
    let token = AbortToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        })
    };
    let started = std::time::Instant::now();
    let (status, _) = run_guest(&guest, false, move |b| b.abort(token)).await;
    canceller.await.unwrap();
    assert_eq!(status.unwrap(), Errno::Canceled.raw() as i32);
    // the ten-second sleep must have been cut short
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[test_log::test(tokio::test)]
async fn close_is_exactly_once_and_badf_after() {
    let assert_badf = |failure_code: u32| {
        format!(
            "(if (i32.ne (global.get $ret) (i32.const 8)) (then (call $proc_exit (i32.const {failure_code}))))"
        )
    };
    let guest = start_module(
        DATA,
        &[
            String::new(),
            step(
                "(call $path_open (i32.const 3) (i32.const 0) (i32.const 2048) (i32.const 9) \
                 (i32.const 0) (i64.const 0) (i64.const 0) (i32.const 0) (i32.const 2100))",
            ) + "\n(global.set $fd (i32.load (i32.const 2100)))",
            step("(call $fd_close (global.get $fd))"),
            step_raw("(call $fd_close (global.get $fd))", &assert_badf(101)),
            format!(
                "(i32.store (i32.const 2112) (i32.const 4096))\n\
                 (i32.store (i32.const 2116) (i32.const 16))\n{}",
                step_raw(
                    "(call $fd_read (global.get $fd) (i32.const 2112) (i32.const 1) (i32.const 2104))",
                    &assert_badf(102)
                )
            ),
            step_raw(
                "(call $fd_write (global.get $fd) (i32.const 2112) (i32.const 1) (i32.const 2108))",
                &assert_badf(103),
            ),
        ],
    );
    for paced in [false, true] {
        let (status, _) = run_guest(&guest, paced, |b| b).await;
        assert_eq!(status.unwrap(), 0);
    }
}

#[test_log::test(tokio::test)]
async fn seek_to_negative_offset_is_inval() {
    let guest = start_module(
        DATA,
        &[
            String::new(),
            step(
                "(call $path_open (i32.const 3) (i32.const 0) (i32.const 2048) (i32.const 9) \
                 (i32.const 0) (i64.const 0) (i64.const 0) (i32.const 0) (i32.const 2100))",
            ) + "\n(global.set $fd (i32.load (i32.const 2100)))",
            step_raw(
                "(call $fd_seek (global.get $fd) (i64.const -1) (i32.const 0) (i32.const 2128))",
                "(call $proc_exit (global.get $ret))",
            ),
        ],
    );
    let (status, _) = run_guest(&guest, false, |b| b).await;
    assert_eq!(status.unwrap(), Errno::Inval.raw() as i32);
}
