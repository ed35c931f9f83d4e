//! Terminal output: banners, the timing table, error lines.

use std::time::Duration;

use owo_colors::{OwoColorize, Stream};
use yb_lib::BuildReport;

pub fn print_error(message: &str) {
  eprintln!(
    "{} {message}",
    "error:".if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_build_passed() {
  println!();
  println!(
    "{}",
    "BUILD PASSED".if_supports_color(Stream::Stdout, |s| s.green())
  );
}

pub fn print_build_failed(message: &str) {
  println!();
  println!(
    "{} {message}",
    "BUILD FAILED".if_supports_color(Stream::Stdout, |s| s.red())
  );
}

/// Per-command timing table with a share-of-total column.
pub fn print_timing_table(report: &BuildReport) {
  let total = report.total();
  if total.is_zero() {
    return;
  }

  println!();
  println!("Build times:");
  for timing in report.timings() {
    let share = 100.0 * timing.duration.as_secs_f64() / total.as_secs_f64();
    println!(
      "  {:>8}  {:>5.1}%  {}",
      format_duration(timing.duration),
      share,
      timing.command
    );
  }
  println!("  {:>8}  100.0%  TOTAL", format_duration(total));
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{millis}ms")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn durations_render_human_readable() {
    assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    assert_eq!(format_duration(Duration::from_millis(2340)), "2.34s");
    assert_eq!(format_duration(Duration::from_secs(95)), "1m 35s");
  }
}
