//! User-agent classification for per-OS browser counters.
//!
//! Names are lowercase and dot-free so they can be used as key segments.

/// Operating system and browser family of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Agent {
    pub os: &'static str,
    pub browser: &'static str,
}

/// Classify a `User-Agent` header. Both families must be recognised.
pub fn classify(user_agent: &str) -> Option<Agent> {
    Some(Agent {
        os: os_family(user_agent)?,
        browser: browser_family(user_agent)?,
    })
}

fn os_family(ua: &str) -> Option<&'static str> {
    // Order matters: Android reports Linux, iOS reports "like Mac OS X".
    const RULES: &[(&str, &str)] = &[
        ("Windows", "windows"),
        ("Android", "android"),
        ("iPhone", "ios"),
        ("iPad", "ios"),
        ("iPod", "ios"),
        ("CrOS", "chromeos"),
        ("Mac OS X", "macos"),
        ("Macintosh", "macos"),
        ("FreeBSD", "freebsd"),
        ("Linux", "linux"),
    ];
    RULES
        .iter()
        .find(|(needle, _)| ua.contains(needle))
        .map(|(_, name)| *name)
}

fn browser_family(ua: &str) -> Option<&'static str> {
    // Chromium derivatives also carry "Chrome/" and "Safari/".
    const RULES: &[(&str, &str)] = &[
        ("Edg/", "edge"),
        ("EdgA/", "edge"),
        ("Edge/", "edge"),
        ("OPR/", "opera"),
        ("Opera", "opera"),
        ("SamsungBrowser/", "samsung browser"),
        ("Firefox/", "firefox"),
        ("FxiOS/", "firefox"),
        ("CriOS/", "chrome"),
        ("Chromium/", "chromium"),
        ("Chrome/", "chrome"),
        ("MSIE ", "ie"),
        ("Trident/", "ie"),
    ];
    if let Some((_, name)) = RULES.iter().find(|(needle, _)| ua.contains(needle)) {
        return Some(name);
    }
    if ua.contains("Safari/") && ua.contains("Version/") {
        return Some("safari");
    }
    None
}
