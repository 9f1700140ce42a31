use std::io::Write;

const BAR_WIDTH: usize = 30;

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// One-line progress bar, e.g. `[█████░░░…]  50.0%  5 B / 10 B`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn progress_line(transferred: u64, total: u64) -> String {
    let pct = if total == 0 {
        100.0
    } else {
        (transferred.min(total) as f64 / total as f64) * 100.0
    };
    let filled = ((pct / 100.0) * BAR_WIDTH as f64) as usize;
    let empty = BAR_WIDTH - filled;
    format!(
        "[{}{}] {pct:>5.1}%  {sent} / {total}",
        "█".repeat(filled),
        "░".repeat(empty),
        sent = format_size(transferred),
        total = format_size(total),
    )
}

/// Overwrites the current line with the progress bar.
pub fn print_progress(transferred: u64, total: u64) {
    print!("\r  {}", progress_line(transferred, total));
    let _ = std::io::stdout().flush();
}

/// Ends the progress line so the next output starts on a fresh one.
pub fn finish_progress() {
    println!();
}
