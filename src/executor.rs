//! パイプライン実行: ビルトイン判定、パイプ接続、リダイレクト適用、
//! プロセスグループ管理、フォアグラウンド/バックグラウンドのディスパッチ。
//!
//! - 単一ビルトイン（非 background、リダイレクトなし）: fork なしの
//!   直接実行パス。`cd` / `exit` がシェル自身に効くのはこのパスだけ
//! - それ以外: ステージごとに fork する統一パス（[`execute_job`]）
//!   - 隣接ステージ間に匿名パイプを 1 本ずつ作成
//!   - 子: シグナル既定化 → プロセスグループ参加 → 不要パイプ端クローズ →
//!     リダイレクト/パイプ接続 → `execvp`（ビルトインならその場で実行して終了）
//!   - 親: fork 直後に pid→pgid を記録し、`setpgid` をリトライ付きで重ねがけ
//!   - foreground: `tcsetpgrp` でターミナルを渡し、SIGCHLD ハンドラの回収を
//!     `sigsuspend` で待つ。background: ジョブ登録と `[N] pgid` 表示だけして戻る
//!
//! fork からジョブ登録完了までは SIGCHLD をブロックし、インデックス未登録の
//! 子をハンドラが先に回収してしまう競合を塞ぐ。

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::IntoRawFd;

use libc::pid_t;

use crate::builtins;
use crate::job::{self, JobState};
use crate::parser::{Command, Pipeline};
use crate::shell::Shell;
use crate::signals;

/// 親側 `setpgid` のリトライ上限。生成直後の子が見えない一時失敗に備える。
const SETPGID_RETRIES: u32 = 5;

/// パイプラインを実行し、終了ステータスを返す。
///
/// `cmd_text` は元のコマンド文字列で、ジョブテーブルの表示用に使用される。
pub fn execute(shell: &mut Shell, pipeline: &Pipeline<'_>, cmd_text: &str) -> i32 {
    // 単一ビルトイン（非 background、リダイレクトなし）→ fork なしの直接実行
    if pipeline.commands.len() == 1 && !pipeline.background {
        let cmd = &pipeline.commands[0];
        if cmd.in_file.is_none() && cmd.out_file.is_none() {
            let args: Vec<&str> = cmd.args.iter().map(|a| a.as_ref()).collect();
            if builtins::is_builtin(args[0]) {
                // is_builtin が真なら try_exec は必ず処理する
                return builtins::try_exec(shell, &args).unwrap_or(1);
            }
        }
    }

    execute_job(shell, pipeline, cmd_text)
}

// ── 子プロセス側 ────────────────────────────────────────────────────

/// ステージの stdin/stdout を配線する。ファイルリダイレクトはパイプ接続より優先。
///
/// 失敗時はエラーを表示して `Err` を返す（呼び出し側が `_exit` する）。
fn wire_stage_io(cmd: &Command<'_>, pipe_in: i32, pipe_out: i32) -> Result<(), ()> {
    if let Some(path) = &cmd.in_file {
        let file = File::open(path.as_ref()).map_err(|e| {
            eprintln!("jsh: {}: {}", path, e);
        })?;
        let fd = file.into_raw_fd();
        unsafe {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::close(fd);
        }
    } else if pipe_in != libc::STDIN_FILENO {
        unsafe {
            libc::dup2(pipe_in, libc::STDIN_FILENO);
            libc::close(pipe_in);
        }
    }

    if let Some(path) = &cmd.out_file {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true);
        if cmd.append {
            opts.append(true);
        } else {
            opts.truncate(true);
        }
        let file = opts.open(path.as_ref()).map_err(|e| {
            eprintln!("jsh: {}: {}", path, e);
        })?;
        let fd = file.into_raw_fd();
        unsafe {
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::close(fd);
        }
    } else if pipe_out != libc::STDOUT_FILENO {
        unsafe {
            libc::dup2(pipe_out, libc::STDOUT_FILENO);
            libc::close(pipe_out);
        }
    }

    Ok(())
}

/// fork 後の子プロセス本体。戻らない。
///
/// シグナルを既定に戻してグループに参加し、自ステージに属さないパイプ端を
/// すべて閉じてから I/O を配線する。ビルトインならその場で実行して結果
/// コードで終了し、それ以外は `execvp` で自身を置き換える。
fn run_stage_child(
    shell: &mut Shell,
    cmd: &Command<'_>,
    pgid: pid_t,
    stage: usize,
    pipes: &[[i32; 2]],
    pipe_in: i32,
    pipe_out: i32,
) -> ! {
    signals::reset_for_child();
    unsafe {
        libc::setpgid(0, pgid);
    }

    // 自ステージが使わないパイプ端を閉じる
    for (k, p) in pipes.iter().enumerate() {
        if stage == 0 || k != stage - 1 {
            if p[0] >= 0 {
                unsafe { libc::close(p[0]) };
            }
        }
        if k != stage && p[1] >= 0 {
            unsafe { libc::close(p[1]) };
        }
    }

    if wire_stage_io(cmd, pipe_in, pipe_out).is_err() {
        unsafe { libc::_exit(1) };
    }

    let args: Vec<&str> = cmd.args.iter().map(|a| a.as_ref()).collect();

    // パイプライン途中のビルトインは子プロセス内で実行して終了する
    if builtins::is_builtin(args[0]) {
        let status = builtins::try_exec(shell, &args).unwrap_or(1);
        unsafe { libc::_exit(status) };
    }

    let argv: Vec<CString> = args
        .iter()
        .map(|s| CString::new(*s).unwrap_or_else(|_| CString::default()))
        .collect();
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
    }

    // execvp が戻った → 失敗
    let err = std::io::Error::last_os_error();
    let status = match err.raw_os_error() {
        Some(libc::ENOENT) => {
            eprintln!("jsh: {}: command not found", args[0]);
            127
        }
        Some(libc::EACCES) => {
            eprintln!("jsh: {}: permission denied", args[0]);
            126
        }
        _ => {
            eprintln!("jsh: {}: {}", args[0], err);
            1
        }
    };
    unsafe { libc::_exit(status) };
}

// ── 親プロセス側 ────────────────────────────────────────────────────

/// 親側でも子をプロセスグループに入れる（子側の `setpgid` との重ねがけ）。
///
/// どちらが先に走っても転送開始までにグループが成立するようにするための
/// 定石。一時失敗（EINTR）は有限回リトライし、EACCES は子が既に exec して
/// 自力でグループに入った後なので成功扱い。
fn join_group_from_parent(pid: pid_t, pgid: pid_t) -> Result<(), std::io::Error> {
    let mut last_err = std::io::Error::from_raw_os_error(0);
    for _ in 0..SETPGID_RETRIES {
        if unsafe { libc::setpgid(pid, pgid) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EACCES) => return Ok(()),
            Some(libc::EINTR) => {
                last_err = err;
                continue;
            }
            _ => return Err(err),
        }
    }
    Err(last_err)
}

/// パイプライン（単一 or 複数ステージ）を子プロセス群として実行する。
fn execute_job(shell: &mut Shell, pipeline: &Pipeline<'_>, cmd_text: &str) -> i32 {
    let n = pipeline.commands.len();

    // ── パイプ作成（8 ステージ以下はスタック配列、超過時はヒープ）──
    let mut pipe_stack: [[i32; 2]; 7] = [[-1; 2]; 7];
    let pipe_count = n.saturating_sub(1);
    let mut pipe_heap: Vec<[i32; 2]> = Vec::new();

    let pipes: &mut [[i32; 2]] = if pipe_count <= 7 {
        &mut pipe_stack[..pipe_count]
    } else {
        pipe_heap.resize(pipe_count, [-1; 2]);
        &mut pipe_heap
    };

    for p in pipes.iter_mut() {
        if unsafe { libc::pipe(p.as_mut_ptr()) } != 0 {
            eprintln!("jsh: pipe: {}", std::io::Error::last_os_error());
            for created in pipes.iter() {
                if created[0] >= 0 {
                    unsafe { libc::close(created[0]) };
                }
                if created[1] >= 0 {
                    unsafe { libc::close(created[1]) };
                }
            }
            return 1;
        }
    }

    // ── PID 配列（8 個以下はスタック）──
    let mut pid_stack: [pid_t; 8] = [0; 8];
    let mut pid_heap: Vec<pid_t> = Vec::new();
    let mut pid_count: usize = 0;

    let pids: &mut [pid_t] = if n <= 8 {
        &mut pid_stack[..n]
    } else {
        pid_heap.resize(n, 0);
        &mut pid_heap
    };

    let mut pgid: pid_t = 0;
    let mut spawn_error = false;
    let mut index_ok = true;

    // fork からジョブ登録完了まで SIGCHLD ハンドラを止める
    signals::block_sigchld();

    for i in 0..n {
        let cmd = &pipeline.commands[i];
        let pipe_in = if i > 0 { pipes[i - 1][0] } else { libc::STDIN_FILENO };
        let pipe_out = if i < n - 1 { pipes[i][1] } else { libc::STDOUT_FILENO };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            eprintln!("jsh: fork: {}", std::io::Error::last_os_error());
            spawn_error = true;
            break;
        }

        if pid == 0 {
            run_stage_child(shell, cmd, pgid, i, pipes, pipe_in, pipe_out);
        }

        // 親: グループ確定 → インデックス記録
        if pgid == 0 {
            pgid = pid;
        }
        if let Err(e) = join_group_from_parent(pid, pgid) {
            eprintln!("jsh: setpgid: {}", e);
            spawn_error = true;
        }
        if !signals::record_child(pid, pgid) {
            // インデックス満杯: このパイプラインはハンドラ経由で追跡できない
            index_ok = false;
        }
        pids[pid_count] = pid;
        pid_count += 1;

        // 消費したパイプ端を親側で close
        if i > 0 && pipes[i - 1][0] >= 0 {
            unsafe { libc::close(pipes[i - 1][0]) };
            pipes[i - 1][0] = -1;
        }
        if i < n - 1 && pipes[i][1] >= 0 {
            unsafe { libc::close(pipes[i][1]) };
            pipes[i][1] = -1;
        }

        if spawn_error {
            break;
        }
    }

    // 未消費のパイプ端を close（エラー中断時の残り。子は EOF を観測して終われる）
    for p in pipes.iter_mut() {
        if p[0] >= 0 {
            unsafe { libc::close(p[0]) };
            p[0] = -1;
        }
        if p[1] >= 0 {
            unsafe { libc::close(p[1]) };
            p[1] = -1;
        }
    }

    let active_pids = &pids[..pid_count];

    if spawn_error {
        // 起動済みの子を回収してからこのパイプラインを諦める
        for &pid in active_pids {
            unsafe {
                libc::waitpid(pid, std::ptr::null_mut(), 0);
            }
            signals::note_reaped(pid);
        }
        signals::unblock_sigchld();
        return 1;
    }

    // コマンドテキストから末尾の & を除いた表示用文字列
    let display_cmd = cmd_text.strip_suffix('&').unwrap_or(cmd_text).trim();

    // 追跡不能なパイプラインは登録しない（運用上の上限として黙って落とす）
    let handle = if index_ok {
        shell.jobs.register(pgid, display_cmd, JobState::Running)
    } else {
        None
    };

    if pipeline.background {
        // バックグラウンド: 登録と報告だけして戻る。完了は SIGCHLD ハンドラが
        // 検出し、次のプロンプトサイクルで通知される。
        if let Some(handle) = handle {
            eprintln!("[{}] {}", handle, pgid);
        }
        signals::unblock_sigchld();
        return 0;
    }

    // ── フォアグラウンド: ターミナルを渡して停止または完了まで待つ ──
    signals::set_foreground(pgid);
    job::give_terminal_to(shell.terminal_fd, pgid);

    let (status, stopped) = match handle {
        Some(handle) => job::wait_for_fg(handle),
        // テーブル満杯: 追跡なしの直接待機にフォールバック
        None => job::wait_for_pgid_direct(pgid),
    };

    signals::clear_foreground();
    job::take_terminal_back(shell.terminal_fd, shell.shell_pgid);

    if stopped {
        // Ctrl+Z で停止: 回線設定を戻し、ジョブはテーブルに残す
        job::restore_termios(shell.terminal_fd, &shell.saved_termios);
        if let Some(handle) = handle {
            eprintln!("\n[{}]+  Stopped   {}", handle, display_cmd);
        }
    } else if let Some(handle) = handle {
        // フォアグラウンド完了は同期的に観測済み。通知は不要なので即解放
        shell.jobs.reclaim(handle);
    }

    signals::unblock_sigchld();
    status
}
