//! ビルトインコマンドの実装。
//!
//! `try_exec()` が `Some(status)` を返せばビルトインとして処理済み、
//! `None` なら外部コマンドとして executor に委ねる。
//!
//! `cd` / `pwd` / `exit` は呼び出し元プロセスの状態だけを触る。
//! `jobs` / `fg` / `bg` はジョブテーブルを参照し、`fg` はさらに
//! ターミナル制御の受け渡しとフォアグラウンド待機を行う。

use std::env;
use std::path::Path;

use crate::job::{self, JobState};
use crate::shell::Shell;
use crate::signals;

/// ビルトインコマンド名か。executor の fork 省略判定に使う。
pub fn is_builtin(name: &str) -> bool {
    matches!(name, "cd" | "pwd" | "exit" | "jobs" | "fg" | "bg")
}

/// ビルトインコマンドの実行を試みる。
///
/// 戻り値:
/// - `Some(status)` — ビルトインとして実行済み
/// - `None` — 該当するビルトインなし（外部コマンドとして実行すべき）
pub fn try_exec(shell: &mut Shell, args: &[&str]) -> Option<i32> {
    match args[0] {
        "cd" => Some(builtin_cd(args)),
        "pwd" => Some(builtin_pwd()),
        "exit" => Some(builtin_exit(shell, args)),
        "jobs" => Some(builtin_jobs(shell)),
        "fg" => Some(builtin_fg(shell, args)),
        "bg" => Some(builtin_bg(shell, args)),
        _ => None,
    }
}

/// `cd [dir]` — カレントディレクトリを変更する。引数省略時は `$HOME` に移動。
fn builtin_cd(args: &[&str]) -> i32 {
    let target = if args.len() > 1 {
        args[1].to_string()
    } else {
        match env::var("HOME") {
            Ok(home) => home,
            Err(_) => {
                eprintln!("jsh: cd: HOME not set");
                return 1;
            }
        }
    };

    if let Err(e) = env::set_current_dir(Path::new(&target)) {
        eprintln!("jsh: cd: {}: {}", target, e);
        1
    } else {
        0
    }
}

/// `pwd` — カレントディレクトリを表示する。
fn builtin_pwd() -> i32 {
    match env::current_dir() {
        Ok(dir) => {
            println!("{}", dir.display());
            0
        }
        Err(e) => {
            eprintln!("jsh: pwd: {}", e);
            1
        }
    }
}

/// `exit [N]` — シェルを終了する。N が指定されればそのコードで、省略時は直前のステータスで終了。
fn builtin_exit(shell: &mut Shell, args: &[&str]) -> i32 {
    shell.should_exit = true;
    if args.len() > 1 {
        args[1].parse::<i32>().unwrap_or_else(|_| {
            eprintln!("jsh: exit: {}: numeric argument required", args[1]);
            2
        })
    } else {
        shell.last_status
    }
}

/// `jobs` — ジョブテーブルを一覧表示する。Done エントリは表示と同時に解放される。
fn builtin_jobs(shell: &mut Shell) -> i32 {
    shell.jobs.list();
    0
}

/// `fg %N` / `bg %N` のジョブ番号引数をパースする。`%` は省略可。
fn parse_job_ref(name: &str, args: &[&str]) -> Result<usize, i32> {
    let Some(arg) = args.get(1) else {
        eprintln!("jsh: {}: job id required", name);
        return Err(2);
    };
    let digits = arg.strip_prefix('%').unwrap_or(arg);
    match digits.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => {
            eprintln!("jsh: {}: {}: no such job", name, arg);
            Err(1)
        }
    }
}

/// `fg %N` — ジョブ N にターミナルを渡し、SIGCONT で再開して待機する。
///
/// ジョブが停止または完了するまでブロックし、終了ステータスを返す。
/// 再度停止した場合はテーブルに残し、完了した場合はハンドルを解放する。
fn builtin_fg(shell: &mut Shell, args: &[&str]) -> i32 {
    let handle = match parse_job_ref("fg", args) {
        Ok(h) => h,
        Err(status) => return status,
    };

    // 状態確認から待機開始までをハンドラから守る
    signals::block_sigchld();
    let state = shell.jobs.state(handle);
    if state == JobState::Unused {
        signals::unblock_sigchld();
        eprintln!("jsh: fg: %{}: no such job", handle);
        return 1;
    }

    let pgid = shell.jobs.pgid(handle);
    println!("{}", shell.jobs.command(handle));

    if state == JobState::Stopped {
        shell.jobs.set_state(handle, JobState::Running);
    }
    signals::set_foreground(pgid);
    job::give_terminal_to(shell.terminal_fd, pgid);
    unsafe {
        libc::kill(-pgid, libc::SIGCONT);
    }

    let (status, stopped) = job::wait_for_fg(handle);

    signals::clear_foreground();
    job::take_terminal_back(shell.terminal_fd, shell.shell_pgid);
    signals::unblock_sigchld();

    if stopped {
        job::restore_termios(shell.terminal_fd, &shell.saved_termios);
        eprintln!("\n[{}]+  Stopped   {}", handle, shell.jobs.command(handle));
    } else {
        shell.jobs.reclaim(handle);
    }
    status
}

/// `bg %N` — ジョブ N に SIGCONT を送って `Running` にする。ブロックしない。
fn builtin_bg(shell: &mut Shell, args: &[&str]) -> i32 {
    let handle = match parse_job_ref("bg", args) {
        Ok(h) => h,
        Err(status) => return status,
    };

    signals::block_sigchld();
    let state = shell.jobs.state(handle);
    if state == JobState::Unused {
        signals::unblock_sigchld();
        eprintln!("jsh: bg: %{}: no such job", handle);
        return 1;
    }

    let pgid = shell.jobs.pgid(handle);
    if state == JobState::Stopped {
        shell.jobs.set_state(handle, JobState::Running);
    }
    // Done を上書きしない: 完了済みなら SIGCONT は届かないだけ
    unsafe {
        libc::kill(-pgid, libc::SIGCONT);
    }
    signals::unblock_sigchld();

    println!("[{}] {} &", handle, shell.jobs.command(handle));
    0
}
