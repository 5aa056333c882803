//! シグナルサブシステム: 対話制御シグナルの転送と子プロセスの非同期回収。
//!
//! - SIGINT / SIGTSTP: フォアグラウンドプロセスグループ全体へ転送
//!   （`kill(-pgid, sig)`）。グループ未設定時は何もしない
//! - SIGCHLD: 回収可能な子の状態変化を `waitpid(-1, WNOHANG)` で
//!   すべてドレインし、pid→pgid インデックス経由でジョブセルを遷移させる
//!
//! ハンドラは任意の命令境界で割り込むため、async-signal-safe な操作
//! （アトミック load/store、固定長配列の線形スキャン、`waitpid`/`kill`）
//! だけで構成し、入出力やヒープ割り当てを行わない。Done 遷移は
//! 通知保留フラグを立てるだけで、ユーザへの表示は制御スレッドが
//! 次のプロンプトサイクルで行う。各ハンドラは entry/exit で errno を
//! 保存・復元し、重なって呼ばれても壊れない。
//!
//! 制御スレッド側の約束事: fork からジョブ登録完了までは
//! [`block_sigchld`] で SIGCHLD をマスクし、フォアグラウンド待機は
//! [`suspend`]（空マスクの `sigsuspend`）で眠る。回収経路はハンドラの
//! 1 本だけになり、OS が報告した順序でジョブ状態に反映される。

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::pid_t;

use crate::job::{self, JobState};

/// pid→pgid インデックスの容量。
pub const MAX_PROCS: usize = 256;

// ── フォアグラウンドグループ / 通知フラグ ───────────────────────────

/// 現在のフォアグラウンドプロセスグループ。0 なら転送先なし。
static FG_PGID: AtomicI32 = AtomicI32::new(0);

/// バックグラウンド完了の通知待ちがあるか。ハンドラが立て、制御スレッドが下ろす。
static NOTIFY_PENDING: AtomicBool = AtomicBool::new(false);

/// フォアグラウンドグループを公開する。SIGINT/SIGTSTP の転送先になる。
pub fn set_foreground(pgid: pid_t) {
    FG_PGID.store(pgid, Ordering::SeqCst);
}

/// フォアグラウンドグループを解除する。
pub fn clear_foreground() {
    FG_PGID.store(0, Ordering::SeqCst);
}

/// 通知保留フラグを取得しつつ下ろす。
pub fn take_notification() -> bool {
    NOTIFY_PENDING.swap(false, Ordering::SeqCst)
}

// ── pid→pgid インデックス ───────────────────────────────────────────

/// 1 子プロセス分のスロット。pid 0 は空きを表す。
struct PidSlot {
    pid: AtomicI32,
    pgid: AtomicI32,
    /// 回収済みなら `true`。スロットは詰め直さず無効化だけ行う。
    reaped: AtomicBool,
}

/// 子プロセスの pid からプロセスグループを引く固定長インデックス。
///
/// executor が fork 直後（SIGCHLD マスク中）に追記し、SIGCHLD ハンドラが
/// 線形スキャンで参照する。回収されたエントリは無効化され、次の追記で
/// 再利用される。
pub struct PidIndex {
    slots: [PidSlot; MAX_PROCS],
}

static PID_INDEX: PidIndex = PidIndex::new();

impl PidIndex {
    pub const fn new() -> Self {
        const SLOT: PidSlot = PidSlot {
            pid: AtomicI32::new(0),
            pgid: AtomicI32::new(0),
            reaped: AtomicBool::new(false),
        };
        Self {
            slots: [SLOT; MAX_PROCS],
        }
    }

    /// pid→pgid の対応を追記する。満杯なら `false`（そのプロセスは追跡外になる）。
    /// SIGCHLD をブロックした制御スレッドからのみ呼ぶこと。
    pub fn record(&self, pid: pid_t, pgid: pid_t) -> bool {
        for slot in &self.slots {
            let cur = slot.pid.load(Ordering::SeqCst);
            if cur == 0 || slot.reaped.load(Ordering::SeqCst) {
                slot.pid.store(pid, Ordering::SeqCst);
                slot.pgid.store(pgid, Ordering::SeqCst);
                slot.reaped.store(false, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    /// 有効なエントリから pgid を引く。停止・再開イベント用（無効化しない）。
    pub fn lookup(&self, pid: pid_t) -> Option<pid_t> {
        for slot in &self.slots {
            if slot.pid.load(Ordering::SeqCst) == pid && !slot.reaped.load(Ordering::SeqCst) {
                return Some(slot.pgid.load(Ordering::SeqCst));
            }
        }
        None
    }

    /// エントリを回収済みとして無効化し、pgid を返す。
    pub fn mark_reaped(&self, pid: pid_t) -> Option<pid_t> {
        for slot in &self.slots {
            if slot.pid.load(Ordering::SeqCst) == pid && !slot.reaped.load(Ordering::SeqCst) {
                slot.reaped.store(true, Ordering::SeqCst);
                return Some(slot.pgid.load(Ordering::SeqCst));
            }
        }
        None
    }

    /// 指定グループに未回収のメンバーが残っているか。
    pub fn any_live(&self, pgid: pid_t) -> bool {
        self.slots.iter().any(|slot| {
            slot.pid.load(Ordering::SeqCst) != 0
                && !slot.reaped.load(Ordering::SeqCst)
                && slot.pgid.load(Ordering::SeqCst) == pgid
        })
    }
}

/// fork 直後の子プロセスをインデックスに登録する。
///
/// `false`（満杯）の場合、ハンドラはこの子をジョブに対応付けられない。
/// 呼び出し側はそのパイプラインをハンドラ経由で待ってはならない。
pub fn record_child(pid: pid_t, pgid: pid_t) -> bool {
    PID_INDEX.record(pid, pgid)
}

/// ハンドラを経由せず回収した pid をインデックスから無効化する
/// （テーブル満杯時の直接待機フォールバック用）。
pub fn note_reaped(pid: pid_t) {
    PID_INDEX.mark_reaped(pid);
}

// ── ハンドラ ────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

/// フォアグラウンドグループへシグナルを転送する。
///
/// グループが既に消えていれば `kill` は ESRCH で失敗するだけで、
/// それ以上の追跡はしない（ベストエフォート転送）。
fn forward_to_foreground(sig: libc::c_int) {
    let saved_errno = unsafe { *errno_location() };
    let pgid = FG_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        unsafe {
            libc::kill(-pgid, sig);
        }
    }
    unsafe { *errno_location() = saved_errno };
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    forward_to_foreground(libc::SIGINT);
}

extern "C" fn handle_sigtstp(_sig: libc::c_int) {
    forward_to_foreground(libc::SIGTSTP);
}

/// SIGCHLD ハンドラ本体。回収可能な状態変化をすべてドレインする。
///
/// pid を指定しない `waitpid(-1, WNOHANG | WUNTRACED | WCONTINUED)` を
/// 失敗するまで回し、各報告をジョブセルに反映する:
/// - 停止 → `Stopped`（ステータスは 128 + 停止シグナル）
/// - 再開 → `Running`
/// - 終了/シグナル終了 → インデックスを無効化し、グループ最後の
///   メンバーなら `Done` + 通知保留フラグ
extern "C" fn handle_sigchld(_sig: libc::c_int) {
    let saved_errno = unsafe { *errno_location() };
    loop {
        let mut raw = 0i32;
        let pid = unsafe {
            libc::waitpid(
                -1,
                &mut raw,
                libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
            )
        };
        if pid <= 0 {
            break;
        }

        if libc::WIFSTOPPED(raw) {
            if let Some(pgid) = PID_INDEX.lookup(pid) {
                if let Some(handle) = job::cells().find_by_pgid(pgid) {
                    job::cells().set_status(handle, 128 + libc::WSTOPSIG(raw));
                    job::cells().set_state(handle, JobState::Stopped);
                }
            }
        } else if libc::WIFCONTINUED(raw) {
            if let Some(pgid) = PID_INDEX.lookup(pid) {
                if let Some(handle) = job::cells().find_by_pgid(pgid) {
                    job::cells().set_state(handle, JobState::Running);
                }
            }
        } else if let Some(pgid) = PID_INDEX.mark_reaped(pid) {
            if let Some(handle) = job::cells().find_by_pgid(pgid) {
                job::cells().set_status(handle, job::encode_wait_status(raw));
                if !PID_INDEX.any_live(pgid) {
                    job::cells().set_state(handle, JobState::Done);
                    NOTIFY_PENDING.store(true, Ordering::SeqCst);
                }
            }
        }
    }
    unsafe { *errno_location() = saved_errno };
}

// ── インストール / マスク操作 ───────────────────────────────────────

/// シェル本体のシグナルハンドラを設定する。起動時に 1 度だけ呼ぶ。
///
/// SIGINT / SIGTSTP は転送ハンドラ、SIGCHLD は回収ハンドラ。いずれも
/// `SA_RESTART` 付きで、行読み取り中の `read` が中断されない。
/// SIGTTOU / SIGTTIN は無視に設定し、`tcsetpgrp` がブロックしないようにする。
pub fn install() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_RESTART;

        sa.sa_sigaction = handle_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());

        sa.sa_sigaction = handle_sigtstp as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigaction(libc::SIGTSTP, &sa, std::ptr::null_mut());

        sa.sa_sigaction = handle_sigchld as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut());

        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
    }
}

fn sigchld_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        set
    }
}

/// SIGCHLD をブロックする。fork〜ジョブ登録の区間をハンドラから守る。
pub fn block_sigchld() {
    let set = sigchld_set();
    unsafe {
        libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// SIGCHLD のブロックを解除する。保留中のシグナルはここで配送される。
pub fn unblock_sigchld() {
    let set = sigchld_set();
    unsafe {
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

/// 空マスクの `sigsuspend` で次のシグナルまで眠る。
///
/// SIGCHLD をブロックした区間から呼ぶことで「状態確認 → 眠る」の間に
/// シグナルを取りこぼさない。
pub fn suspend() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigsuspend(&set);
    }
}

/// fork 直後の子プロセスでシグナル設定を既定に戻す。
///
/// シェルが握っていた対話制御シグナルを `SIG_DFL` に戻し（未処理の
/// SIGINT で子が実際に死ぬように）、親から継承した SIGCHLD マスクを
/// 解除する。ブロックマスクは exec を越えて残るため、解除は必須。
pub fn reset_for_child() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTSTP, libc::SIG_DFL);
        libc::signal(libc::SIGTTOU, libc::SIG_DFL);
        libc::signal(libc::SIGTTIN, libc::SIG_DFL);
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    }
    unblock_sigchld();
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_lookup() {
        static INDEX: PidIndex = PidIndex::new();
        assert!(INDEX.record(100, 10));
        assert!(INDEX.record(101, 10));
        assert!(INDEX.record(200, 20));
        assert_eq!(INDEX.lookup(100), Some(10));
        assert_eq!(INDEX.lookup(200), Some(20));
        assert_eq!(INDEX.lookup(999), None);
    }

    #[test]
    fn mark_reaped_invalidates_entry() {
        static INDEX: PidIndex = PidIndex::new();
        INDEX.record(100, 10);
        assert_eq!(INDEX.mark_reaped(100), Some(10));
        // 無効化後は lookup も再回収も失敗する
        assert_eq!(INDEX.lookup(100), None);
        assert_eq!(INDEX.mark_reaped(100), None);
    }

    #[test]
    fn any_live_tracks_group_members() {
        static INDEX: PidIndex = PidIndex::new();
        INDEX.record(100, 10);
        INDEX.record(101, 10);
        assert!(INDEX.any_live(10));
        INDEX.mark_reaped(100);
        assert!(INDEX.any_live(10));
        INDEX.mark_reaped(101);
        assert!(!INDEX.any_live(10));
    }

    #[test]
    fn reaped_slot_is_reused() {
        static INDEX: PidIndex = PidIndex::new();
        for pid in 1..=MAX_PROCS as i32 {
            assert!(INDEX.record(pid, 1));
        }
        assert!(!INDEX.record(9999, 1));
        INDEX.mark_reaped(3);
        assert!(INDEX.record(9999, 2));
        assert_eq!(INDEX.lookup(9999), Some(2));
    }

    #[test]
    fn notification_flag_is_take_once() {
        NOTIFY_PENDING.store(true, Ordering::SeqCst);
        assert!(take_notification());
        assert!(!take_notification());
    }
}
