pub const NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Architecture token used in installer filenames and the user agent.
pub fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "x86",
        other => other,
    }
}

pub fn user_agent() -> String {
    format!("Pangolin-Windows/{} ({})", NUMBER, arch())
}

/// Unofficial builds refuse the self-update path. Release builds count as
/// official; development builds can opt in for testing.
pub fn is_official_build() -> bool {
    if std::env::var("PANGOLIN_ALLOW_DEV_UPDATES").as_deref() == Ok("1") {
        return true;
    }
    !cfg!(debug_assertions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_carries_version() {
        assert!(user_agent().contains(NUMBER));
    }
}
