//! jsh ベンチマーク: レキサとパーサーの計測。
//!
//! `std::time::Instant` による手動計測（外部クレート不要）。
//!
//! 実行: `cargo bench`

use std::time::{Duration, Instant};

// ── ベンチマークインフラ ──────────────────────────────────────────

struct BenchResult {
    category: &'static str,
    name: &'static str,
    avg: Duration,
    min: Duration,
    iters: u64,
}

impl BenchResult {
    fn print(&self) {
        println!(
            "[{:<6}] {:<36}  avg {:>9.2}µs  min {:>9.2}µs  ({} iters)",
            self.category,
            self.name,
            self.avg.as_nanos() as f64 / 1000.0,
            self.min.as_nanos() as f64 / 1000.0,
            self.iters,
        );
    }
}

/// バッチ計測: 100 回単位で計測して最速バッチの平均を min として報告する。
fn bench<F: FnMut()>(category: &'static str, name: &'static str, iters: u64, mut f: F) -> BenchResult {
    const BATCH: u64 = 100;

    // ウォームアップ
    for _ in 0..BATCH.min(iters) {
        f();
    }

    let batches = (iters / BATCH).max(1);
    let mut total = Duration::ZERO;
    let mut min_batch = Duration::MAX;
    for _ in 0..batches {
        let start = Instant::now();
        for _ in 0..BATCH {
            f();
        }
        let elapsed = start.elapsed();
        total += elapsed;
        if elapsed < min_batch {
            min_batch = elapsed;
        }
    }

    BenchResult {
        category,
        name,
        avg: total / (batches * BATCH) as u32,
        min: min_batch / BATCH as u32,
        iters: batches * BATCH,
    }
}

/// 入力行を字句解析してパースする（REPL と同じ経路）。
fn parse_line(input: &str) {
    let (tokens, _) = jsh::lexer::lex(input, 0);
    let _ = jsh::parser::parse(tokens);
}

// ── メイン ────────────────────────────────────────────────────────

fn main() {
    println!("jsh benchmark suite");
    println!("{}", "=".repeat(80));

    let mut results = Vec::new();

    // ── レキサベンチマーク ──
    println!("\n--- Lexer ---");

    results.push(bench("lexer", "echo hello", 10_000, || {
        let _ = jsh::lexer::lex("echo hello", 0);
    }));

    results.push(bench("lexer", "echo \"hello $HOME world\"", 10_000, || {
        let _ = jsh::lexer::lex("echo \"hello $HOME world\"", 0);
    }));

    results.push(bench("lexer", "ls -l | grep Cargo | wc -l", 10_000, || {
        let _ = jsh::lexer::lex("ls -l | grep Cargo | wc -l", 0);
    }));

    for r in &results {
        r.print();
    }
    results.clear();

    // ── パーサーベンチマーク ──
    println!("\n--- Parser (lex + parse) ---");

    results.push(bench("parser", "echo hello", 10_000, || {
        parse_line("echo hello");
    }));

    results.push(bench("parser", "ls | grep Cargo | head -1", 10_000, || {
        parse_line("ls | grep Cargo | head -1");
    }));

    results.push(bench(
        "parser",
        "sort < in.txt > out.txt",
        10_000,
        || {
            parse_line("sort < in.txt > out.txt");
        },
    ));

    results.push(bench("parser", "sleep 1 &", 10_000, || {
        parse_line("sleep 1 &");
    }));

    for r in &results {
        r.print();
    }

    println!("\n{}", "=".repeat(80));
    println!("done.");
}
