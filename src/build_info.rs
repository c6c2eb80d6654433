use chrono::{DateTime, Utc};

pub fn build_host() -> &'static str {
    option_env!("PINE_BUILD_HOST").unwrap_or("unknown")
}

fn build_time() -> Option<DateTime<Utc>> {
    let secs: i64 = option_env!("PINE_BUILD_EPOCH")?.parse().ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0)
}

pub fn banner() -> String {
    let when = build_time()
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "an unknown time".to_string());
    format!(
        "Pine {} (built {when} on {})",
        env!("CARGO_PKG_VERSION"),
        build_host()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_names_the_version() {
        let banner = banner();
        assert!(banner.starts_with("Pine "), "banner: {banner}");
        assert!(banner.contains(env!("CARGO_PKG_VERSION")), "banner: {banner}");
    }
}
