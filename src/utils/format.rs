/// Renders a countdown as `MM:SS`, flooring both parts. Minutes are not capped at 59.
pub fn format_clock(seconds: f64) -> String {
    let seconds = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    };
    let mins = (seconds / 60.0).floor() as u64;
    let secs = (seconds % 60.0).floor() as u64;
    format!("{mins:02}:{secs:02}")
}
