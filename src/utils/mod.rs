// Small helpers shared across modules.

use std::time::Duration;

/// Quote a string for use as a SQL identifier. Embedded double quotes are
/// doubled, so startup-supplied names cannot break out of the identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render an elapsed time for session logs, millisecond precision.
/// Leading zero units are dropped: `0.250s`, `12.040s`, `3m07.001s`,
/// `2h00m59.999s`.
pub fn human_duration(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    let (seconds, millis) = (millis / 1000, millis % 1000);
    let (minutes, seconds) = (seconds / 60, seconds % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);

    if hours > 0 {
        format!("{hours}h{minutes:02}m{seconds:02}.{millis:03}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}.{millis:03}s")
    } else {
        format!("{seconds}.{millis:03}s")
    }
}
