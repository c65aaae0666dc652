//! Chrome command-line arguments for pooled instances.

use ad_radar_common::BrowserPoolConfig;

/// Build the argument list for one pooled Chrome process.
///
/// The set is tuned for long-lived, resource-light scraping: background
/// throttling is off so timers in unfocused tabs keep running, images are
/// not decoded, and the disk cache is kept small.
pub fn chrome_args(config: &BrowserPoolConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(20);

    // The namespace sandbox needs SYS_ADMIN, which containers rarely grant
    if config.in_container {
        args.push("--no-sandbox".into());
    }
    args.push("--disable-dev-shm-usage".into());

    // Anti-detection
    args.push("--disable-blink-features=AutomationControlled".into());
    args.push("--exclude-switches=enable-automation".into());

    let (width, height) = config.viewport;
    args.push(format!("--window-size={},{}", width, height));
    args.push(format!("--user-agent={}", config.user_agent));

    args.push("--no-first-run".into());
    args.push("--no-default-browser-check".into());
    args.push("--disable-extensions".into());
    args.push("--mute-audio".into());

    // Keep timers and rendering alive in background tabs
    args.push("--disable-background-timer-throttling".into());
    args.push("--disable-backgrounding-occluded-windows".into());
    args.push("--disable-renderer-backgrounding".into());

    if config.disable_images {
        args.push("--blink-settings=imagesEnabled=false".into());
    }

    args.push("--disk-cache-size=52428800".into()); // 50MB
    args.push("--js-flags=--max-old-space-size=512".into());

    if config.headless {
        args.push("--disable-gpu".into());
    }

    args
}
