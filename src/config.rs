use std::time::Duration;

/// Side length of a docked tray icon window, in pixels. Fetched icon
/// pixmaps are scaled down to fit this square, never up.
pub const ICON_SIZE: u16 = 22;

/// Background of the icon windows: "#rrggbb" or a core X11 colour name.
pub const BG_COLOR: &str = "#222222";

/// Grace period after a new tray owner appears before re-docking, so the
/// new tray has its selection machinery up. Tune here if a window manager
/// needs longer; do not remove.
pub const REDOCK_DELAY_MS: u64 = 100;

/// Upper bound on one event-loop wait. The tray selection owner is polled
/// once per tick, so this is also the worst-case redock latency.
pub const TICK_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for the blocking IconPixmap property fetch.
pub const PROPERTY_CALL_TIMEOUT: Duration = Duration::from_secs(1);
