use chrono::Local;

/// Timestamped key=value event line on stderr. When pine runs under systemd
/// this is the journald surface.
pub fn pine_event(component: &str, tree: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match tree {
        Some(name) => eprintln!("{ts} [{component}] tree={name} {}", msg.as_ref()),
        None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
    }
}
