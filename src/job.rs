//! ジョブテーブルとジョブ制御ヘルパー。
//!
//! フォアグラウンド待機 ([`wait_for_fg`])、完了通知 ([`JobTable::notify_finished`])、
//! ターミナル制御 ([`give_terminal_to`] / [`take_terminal_back`]) を提供する。
//! executor と builtins の両方から利用し、循環依存を回避する。
//!
//! ## 2 層構造
//!
//! ジョブの状態はシグナルハンドラ（SIGCHLD reaper）からも更新されるため、
//! テーブルを 2 層に分割している:
//!
//! - [`JobCells`] — 固定長スロット配列。pgid / 状態 / 終了ステータスを
//!   アトミックに保持し、`'static` インスタンスをハンドラと共有する。
//!   ハンドラ側の操作はアトミックストアと線形スキャンのみで、
//!   ヒープ割り当てに到達する経路が存在しない。
//! - [`JobTable`] — 制御スレッド専有。表示用コマンド文字列と通知済み
//!   フラグを持ち、状態参照は [`JobCells`] に委譲する。
//!
//! ジョブハンドルは 1 以上の整数。0 は「ジョブなし」と区別するため欠番。

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use libc::pid_t;

use crate::signals;

/// ジョブテーブルの容量。超過分のジョブは登録されず追跡外で実行される。
pub const MAX_JOBS: usize = 16;

// ── 状態 ────────────────────────────────────────────────────────────

const STATE_UNUSED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;
const STATE_DONE: u8 = 3;

/// ジョブのライフサイクル状態。
///
/// 遷移: `Running` → `Stopped`（グループ停止）、`Stopped` → `Running`（再開）、
/// `Running`/`Stopped` → `Done`（グループ最後のプロセスの回収）。
/// `Done` は終端で、ユーザへの報告後にスロットが [`JobState::Unused`] に戻る。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Unused,
    Running,
    Stopped,
    Done,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_RUNNING => Self::Running,
            STATE_STOPPED => Self::Stopped,
            STATE_DONE => Self::Done,
            _ => Self::Unused,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unused => STATE_UNUSED,
            Self::Running => STATE_RUNNING,
            Self::Stopped => STATE_STOPPED,
            Self::Done => STATE_DONE,
        }
    }

    /// `jobs` 出力・完了通知用の表示文字列。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unused => "Unused",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Done => "Done",
        }
    }
}

// ── JobCells ────────────────────────────────────────────────────────

/// 1 ジョブ分のアトミックセル。
struct JobCell {
    /// プロセスグループ ID。`kill(-pgid, sig)` / `tcsetpgrp` で使用。
    pgid: AtomicI32,
    state: AtomicU8,
    /// 最後に回収されたメンバーのエンコード済み終了ステータス
    /// （終了コードそのまま、またはシグナル終了/停止で 128 + シグナル番号）。
    status: AtomicI32,
}

/// 固定容量のジョブ状態配列。SIGCHLD ハンドラと制御スレッドで共有される。
///
/// 新規スロットの確保と pgid/コマンド文字列の書き込みは SIGCHLD を
/// ブロックした制御スレッドからのみ行われる。ハンドラが行うのは
/// 既存スロットの状態遷移とステータス記録だけ。
pub struct JobCells {
    cells: [JobCell; MAX_JOBS],
}

static CELLS: JobCells = JobCells::new();

/// プロセス全体で共有されるジョブ状態配列。
pub fn cells() -> &'static JobCells {
    &CELLS
}

impl JobCells {
    pub const fn new() -> Self {
        const CELL: JobCell = JobCell {
            pgid: AtomicI32::new(0),
            state: AtomicU8::new(STATE_UNUSED),
            status: AtomicI32::new(0),
        };
        Self {
            cells: [CELL; MAX_JOBS],
        }
    }

    /// 最小の空きハンドル（1 始まり）を確保して `initial` 状態で初期化する。
    /// 満杯なら `None`。呼び出し側は SIGCHLD をブロックしていること。
    pub fn alloc(&self, pgid: pid_t, initial: JobState) -> Option<usize> {
        for (i, cell) in self.cells.iter().enumerate() {
            if cell
                .state
                .compare_exchange(STATE_UNUSED, initial.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                cell.pgid.store(pgid, Ordering::SeqCst);
                cell.status.store(0, Ordering::SeqCst);
                return Some(i + 1);
            }
        }
        None
    }

    /// pgid からハンドルを検索する。未使用スロットは対象外。
    pub fn find_by_pgid(&self, pgid: pid_t) -> Option<usize> {
        for (i, cell) in self.cells.iter().enumerate() {
            if cell.state.load(Ordering::SeqCst) != STATE_UNUSED
                && cell.pgid.load(Ordering::SeqCst) == pgid
            {
                return Some(i + 1);
            }
        }
        None
    }

    pub fn state(&self, handle: usize) -> JobState {
        match self.cell(handle) {
            Some(cell) => JobState::from_u8(cell.state.load(Ordering::SeqCst)),
            None => JobState::Unused,
        }
    }

    pub fn set_state(&self, handle: usize, state: JobState) {
        if let Some(cell) = self.cell(handle) {
            cell.state.store(state.as_u8(), Ordering::SeqCst);
        }
    }

    pub fn status(&self, handle: usize) -> i32 {
        self.cell(handle)
            .map_or(0, |c| c.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, handle: usize, status: i32) {
        if let Some(cell) = self.cell(handle) {
            cell.status.store(status, Ordering::SeqCst);
        }
    }

    pub fn pgid(&self, handle: usize) -> pid_t {
        self.cell(handle).map_or(0, |c| c.pgid.load(Ordering::SeqCst))
    }

    /// スロットを解放してハンドルを再利用可能にする。
    pub fn release(&self, handle: usize) {
        if let Some(cell) = self.cell(handle) {
            cell.pgid.store(0, Ordering::SeqCst);
            cell.status.store(0, Ordering::SeqCst);
            cell.state.store(STATE_UNUSED, Ordering::SeqCst);
        }
    }

    fn cell(&self, handle: usize) -> Option<&JobCell> {
        // ハンドル 0 は欠番
        handle
            .checked_sub(1)
            .and_then(|i| self.cells.get(i))
    }
}

// ── JobTable ────────────────────────────────────────────────────────

/// ハンドルごとの表示用情報。制御スレッドのみが触る。
struct JobEntry {
    command: String,
    /// Done をユーザに表示済みかどうか。表示したパスがスロットを解放する。
    notified: bool,
}

/// ジョブテーブルの制御スレッド側。[`Shell`](crate::shell::Shell) が所有し、
/// executor と builtins の両方からアクセスされる。
pub struct JobTable {
    cells: &'static JobCells,
    entries: [Option<JobEntry>; MAX_JOBS],
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_cells(cells())
    }

    /// テスト用に任意のセル配列と組み合わせる。
    pub fn with_cells(cells: &'static JobCells) -> Self {
        Self {
            cells,
            entries: std::array::from_fn(|_| None),
        }
    }

    /// ジョブを登録し、割り当てたハンドルを返す。
    /// テーブル満杯時は `None`（呼び出し側はジョブを追跡せずに実行を続ける）。
    pub fn register(&mut self, pgid: pid_t, command: &str, initial: JobState) -> Option<usize> {
        let handle = self.cells.alloc(pgid, initial)?;
        self.entries[handle - 1] = Some(JobEntry {
            command: command.to_string(),
            notified: false,
        });
        Some(handle)
    }

    pub fn find_by_pgid(&self, pgid: pid_t) -> Option<usize> {
        self.cells.find_by_pgid(pgid)
    }

    pub fn state(&self, handle: usize) -> JobState {
        self.cells.state(handle)
    }

    pub fn set_state(&self, handle: usize, state: JobState) {
        self.cells.set_state(handle, state);
    }

    pub fn status(&self, handle: usize) -> i32 {
        self.cells.status(handle)
    }

    pub fn pgid(&self, handle: usize) -> pid_t {
        self.cells.pgid(handle)
    }

    pub fn command(&self, handle: usize) -> &str {
        handle
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .and_then(|e| e.as_ref())
            .map_or("", |e| e.command.as_str())
    }

    /// ハンドルを解放する。登録済みエントリとセルの両方をクリア。
    pub fn reclaim(&mut self, handle: usize) {
        if let Some(i) = handle.checked_sub(1) {
            if let Some(entry) = self.entries.get_mut(i) {
                *entry = None;
            }
        }
        self.cells.release(handle);
    }

    /// 未通知の Done ジョブを stderr に表示し、スロットを解放する。
    ///
    /// プロンプト表示前に呼ばれる。1 ジョブにつき通知はちょうど 1 回で、
    /// 表示後はハンドルが再利用可能になる。
    pub fn notify_finished(&mut self) {
        for handle in 1..=MAX_JOBS {
            if self.cells.state(handle) != JobState::Done {
                continue;
            }
            let reported = match &self.entries[handle - 1] {
                Some(e) => e.notified,
                None => true, // 追跡情報なし（fg で回収済み等）→ 表示しない
            };
            if !reported {
                eprintln!("[{}]   Done   {}", handle, self.command(handle));
            }
            self.reclaim(handle);
        }
    }

    /// 全ジョブを stdout に一覧表示する。
    ///
    /// Done エントリは表示した時点で役目を終えるため、副作用として解放する。
    /// これが「通知前に `jobs` を打った」ケースの回収経路になる。
    pub fn list(&mut self) {
        for handle in 1..=MAX_JOBS {
            let state = self.cells.state(handle);
            if state == JobState::Unused {
                continue;
            }
            println!("[{}]   {}   {}", handle, state.as_str(), self.command(handle));
            if state == JobState::Done {
                self.reclaim(handle);
            }
        }
    }
}

// ── 待機ヘルパー ─────────────────────────────────────────────────────

/// raw wait ステータスを終了コードにエンコードする。
/// 正常終了は終了コードそのまま、シグナル終了・停止は 128 + シグナル番号。
pub(crate) fn encode_wait_status(raw: i32) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        128 + libc::WTERMSIG(raw)
    } else if libc::WIFSTOPPED(raw) {
        128 + libc::WSTOPSIG(raw)
    } else {
        1
    }
}

/// フォアグラウンドジョブの状態変化を待つ。
///
/// SIGCHLD をブロックした状態で呼ぶこと。回収は SIGCHLD ハンドラが行い、
/// ここではジョブセルが `Running` を抜けるまで `sigsuspend` で眠るだけ。
/// 戻り値は `(エンコード済み終了ステータス, 停止したか)`。
pub fn wait_for_fg(handle: usize) -> (i32, bool) {
    loop {
        match cells().state(handle) {
            JobState::Running => signals::suspend(),
            JobState::Stopped => return (cells().status(handle), true),
            JobState::Done => return (cells().status(handle), false),
            // 登録が消えた場合は完了扱い
            JobState::Unused => return (0, false),
        }
    }
}

/// ジョブテーブルを経由しない直接待機。テーブル満杯時のフォールバック。
///
/// SIGCHLD をブロックしたまま `waitpid(-pgid, WUNTRACED)` をループし、
/// グループ全体の完了または停止を待つ。回収した pid はインデックスからも
/// 無効化し、ハンドラ側の残留エントリを防ぐ。
pub fn wait_for_pgid_direct(pgid: pid_t) -> (i32, bool) {
    let mut last_raw = 0i32;
    loop {
        let mut raw = 0i32;
        let pid = unsafe { libc::waitpid(-pgid, &mut raw, libc::WUNTRACED) };
        if pid <= 0 {
            break;
        }
        signals::note_reaped(pid);
        last_raw = raw;
        if libc::WIFSTOPPED(raw) {
            return (encode_wait_status(raw), true);
        }
    }
    (encode_wait_status(last_raw), false)
}

// ── ターミナル制御ヘルパー ───────────────────────────────────────────

/// `tcsetpgrp` でターミナルのフォアグラウンドプロセスグループを `pgid` に設定する。
///
/// フォアグラウンドジョブの実行前、および `fg` ビルトインから呼ばれる。
/// シェルが SIGTTOU を無視しているため、この呼び出しがブロックすることはない。
pub fn give_terminal_to(terminal_fd: i32, pgid: pid_t) {
    unsafe {
        libc::tcsetpgrp(terminal_fd, pgid);
    }
}

/// ターミナルのフォアグラウンドプロセスグループをシェル自身に戻す。
pub fn take_terminal_back(terminal_fd: i32, shell_pgid: pid_t) {
    unsafe {
        libc::tcsetpgrp(terminal_fd, shell_pgid);
    }
}

/// 起動時に保存した回線設定を復元する。
///
/// raw モードのまま停止したジョブがターミナルを壊した状態で
/// プロンプトに戻らないよう、停止検出時に呼ばれる。
pub fn restore_termios(terminal_fd: i32, saved: &libc::termios) {
    unsafe {
        libc::tcsetattr(terminal_fd, libc::TCSADRAIN, saved);
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_assigns_lowest_free_handle() {
        static CELLS: JobCells = JobCells::new();
        assert_eq!(CELLS.alloc(100, JobState::Running), Some(1));
        assert_eq!(CELLS.alloc(200, JobState::Running), Some(2));
        assert_eq!(CELLS.alloc(300, JobState::Running), Some(3));
        // 真ん中を解放すると次の確保はそこに入る
        CELLS.release(2);
        assert_eq!(CELLS.alloc(400, JobState::Running), Some(2));
    }

    #[test]
    fn alloc_fails_when_full() {
        static CELLS: JobCells = JobCells::new();
        for i in 0..MAX_JOBS {
            assert_eq!(CELLS.alloc(1000 + i as i32, JobState::Running), Some(i + 1));
        }
        assert_eq!(CELLS.alloc(9999, JobState::Running), None);
        CELLS.release(5);
        assert_eq!(CELLS.alloc(9999, JobState::Running), Some(5));
    }

    #[test]
    fn find_by_pgid_skips_unused() {
        static CELLS: JobCells = JobCells::new();
        let h = CELLS.alloc(42, JobState::Running).unwrap();
        assert_eq!(CELLS.find_by_pgid(42), Some(h));
        assert_eq!(CELLS.find_by_pgid(43), None);
        CELLS.release(h);
        assert_eq!(CELLS.find_by_pgid(42), None);
    }

    #[test]
    fn state_transitions() {
        static CELLS: JobCells = JobCells::new();
        let h = CELLS.alloc(7, JobState::Running).unwrap();
        assert_eq!(CELLS.state(h), JobState::Running);
        CELLS.set_state(h, JobState::Stopped);
        assert_eq!(CELLS.state(h), JobState::Stopped);
        CELLS.set_state(h, JobState::Running);
        CELLS.set_state(h, JobState::Done);
        CELLS.set_status(h, 130);
        assert_eq!(CELLS.state(h), JobState::Done);
        assert_eq!(CELLS.status(h), 130);
    }

    #[test]
    fn handle_zero_is_never_issued() {
        static CELLS: JobCells = JobCells::new();
        assert_eq!(CELLS.state(0), JobState::Unused);
        assert_eq!(CELLS.alloc(1, JobState::Running), Some(1));
        // 範囲外ハンドルも安全に Unused 扱い
        assert_eq!(CELLS.state(MAX_JOBS + 1), JobState::Unused);
    }

    #[test]
    fn table_keeps_command_text() {
        static CELLS: JobCells = JobCells::new();
        let mut table = JobTable::with_cells(&CELLS);
        let h = table.register(11, "sleep 10", JobState::Running).unwrap();
        assert_eq!(table.command(h), "sleep 10");
        assert_eq!(table.find_by_pgid(11), Some(h));
        table.reclaim(h);
        assert_eq!(table.command(h), "");
        assert_eq!(table.find_by_pgid(11), None);
    }

    #[test]
    fn table_register_full_returns_none() {
        static CELLS: JobCells = JobCells::new();
        let mut table = JobTable::with_cells(&CELLS);
        for i in 0..MAX_JOBS {
            assert!(table.register(i as i32 + 1, "cmd", JobState::Running).is_some());
        }
        assert!(table.register(999, "cmd", JobState::Running).is_none());
    }

    #[test]
    fn handle_reuse_only_after_reclaim() {
        static CELLS: JobCells = JobCells::new();
        let mut table = JobTable::with_cells(&CELLS);
        let h1 = table.register(21, "first", JobState::Running).unwrap();
        table.set_state(h1, JobState::Done);
        // Done でもまだ解放されていないので別ハンドルが割り当てられる
        let h2 = table.register(22, "second", JobState::Running).unwrap();
        assert_ne!(h1, h2);
        table.reclaim(h1);
        let h3 = table.register(23, "third", JobState::Running).unwrap();
        assert_eq!(h3, h1);
    }
}
