//! jsh — ジョブ制御を備えた対話シェル
//!
//! REPL ループ: 完了通知ドレイン → プロンプト表示 → 1 行読み取り →
//! 字句解析 → パース → 実行 → ループ
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`lexer`] | 字句解析（クォート、エスケープ、コメント、変数展開 `$VAR`/`$?`、演算子） |
//! | [`parser`] | 構文解析（パイプラインステージ、リダイレクト、バックグラウンド指定） |
//! | [`executor`] | パイプライン実行（パイプ接続、fork、プロセスグループ、fg/bg） |
//! | [`builtins`] | ビルトイン（`cd`, `pwd`, `exit`, `jobs`, `fg`, `bg`） |
//! | [`job`] | ジョブテーブル（固定長アトミックセル + 表示用テーブル、待機、ターミナル制御） |
//! | [`signals`] | シグナル転送と SIGCHLD 回収、pid→pgid インデックス、マスク操作 |
//! | [`shell`] | シェルのセッション状態（終了ステータス、ジョブテーブル、ターミナル） |

mod builtins;
mod executor;
mod job;
mod lexer;
mod parser;
mod shell;
mod signals;

use std::io::{self, BufRead, Write};

use shell::Shell;

/// プロンプト用のカレントディレクトリ文字列。
fn cwd_display() -> String {
    match std::env::current_dir() {
        Ok(dir) => dir.display().to_string(),
        Err(_) => String::from("?"),
    }
}

fn main() {
    // ハンドラ設定: SIGINT/SIGTSTP はフォアグラウンドグループへの転送、
    // SIGCHLD は非同期回収。子プロセスは fork 後に SIG_DFL へ戻される。
    signals::install();

    // シェルを自身のプロセスグループリーダーにし、ターミナルを掌握する
    unsafe {
        let shell_pid = libc::getpid();
        libc::setpgid(shell_pid, shell_pid);
        libc::tcsetpgrp(libc::STDIN_FILENO, shell_pid);
    }

    let mut shell = Shell::new();
    let stdin = io::stdin();

    loop {
        // バックグラウンド完了の通知はプロンプトの直前にまとめて出す。
        // ハンドラはフラグを立てるだけなので、出力がプロンプトと
        // 行の途中で混ざることはない。
        if signals::take_notification() {
            shell.jobs.notify_finished();
        }

        print!("shell[{}]:{}$ ", shell.last_status, cwd_display());
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                // EOF (Ctrl+D): 改行を出力して終了
                println!();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("jsh: read: {}", e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        let (tokens, unmatched) = lexer::lex(&line, shell.last_status);
        if let Some(quote) = unmatched {
            // 未閉クォートは警告にとどめ、途中までのトークンで続行する
            eprintln!("jsh: warning: unmatched {}", quote);
        }

        match parser::parse(tokens) {
            Ok(Some(pipeline)) => {
                shell.last_status = executor::execute(&mut shell, &pipeline, line.trim());
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("jsh: {}", e);
                shell.last_status = 2;
            }
        }

        if shell.should_exit {
            break;
        }
    }

    std::process::exit(shell.last_status);
}
