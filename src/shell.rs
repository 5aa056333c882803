//! シェルのセッション状態を保持するモジュール。
//!
//! 環境変数は `std::env` を直接使用し、子プロセスへの自動継承を活用する。
//! 起動時に 1 度初期化され、プロセス終了まで生きる。

use libc::pid_t;

use crate::job::JobTable;

/// シェルの実行状態。REPL ループ全体で共有される。
pub struct Shell {
    /// 直前のフォアグラウンドパイプラインの終了ステータス。
    /// プロンプト表示、`exit` のデフォルト値、`$?` 展開に使う。
    pub last_status: i32,
    /// `exit` ビルトインで true にセットされ、REPL ループを終了させる。
    pub should_exit: bool,
    /// ジョブテーブルの制御スレッド側。
    pub jobs: JobTable,
    /// シェル自身のプロセスグループ ID。ターミナル返却先。
    pub shell_pgid: pid_t,
    /// 制御ターミナルのファイルディスクリプタ（通常 STDIN_FILENO）。
    pub terminal_fd: i32,
    /// 起動時の回線設定。raw モードのまま停止したジョブからの復帰に使う。
    pub saved_termios: libc::termios,
}

impl Shell {
    pub fn new() -> Self {
        let terminal_fd = libc::STDIN_FILENO;
        let shell_pgid = unsafe { libc::getpgrp() };
        let saved_termios = unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            libc::tcgetattr(terminal_fd, &mut tio);
            tio
        };
        Self {
            last_status: 0,
            should_exit: false,
            jobs: JobTable::new(),
            shell_pgid,
            terminal_fd,
            saved_termios,
        }
    }
}
