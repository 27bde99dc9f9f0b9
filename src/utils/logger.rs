//! Structured logging setup. Mirrors the rolling-file-appender style used throughout the
//! reference codebase, renamed for the `wax` store.

/// Initializes logging from the default file `log4rs.yaml` in the working directory.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}

/// Initializes logging to a store-scoped folder next to the container file:
/// `{base}/{store_name}_logs/{store_name}.log`, plus a `diagnostics` channel fed by `dev6!`.
///
/// # Errors
/// Returns an error if the directory cannot be created or the logger fails to initialize.
pub fn init_for_store(base_dir: &std::path::Path, store_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::rolling_file::RollingFileAppender;
    use log4rs::append::rolling_file::policy::compound::{
        CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
    };
    use log4rs::config::{Appender, Config, Logger, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use std::fs;
    use std::path::PathBuf;

    let mut dir = PathBuf::from(base_dir);
    dir.push(format!("{store_name}_logs"));
    fs::create_dir_all(&dir)?;

    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";

    let app_log = dir.join(format!("{store_name}.log"));
    let app_roller =
        FixedWindowRoller::builder().build(&format!("{}", dir.join(format!("{store_name}.{{}}.log")).display()), 7)?;
    let app_policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(app_roller));
    let app_appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(app_log, Box::new(app_policy))?;

    let diag_log = dir.join(format!("{store_name}_diagnostics.log"));
    let diag_roller = FixedWindowRoller::builder()
        .build(&format!("{}", dir.join(format!("{store_name}.diagnostics.{{}}.log")).display()), 7)?;
    let diag_policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(diag_roller));
    let diag_appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(diag_log, Box::new(diag_policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("app", Box::new(app_appender)))
        .appender(Appender::builder().build("diagnostics", Box::new(diag_appender)))
        .logger(Logger::builder().appender("diagnostics").additive(false).build("wax::dev6", LevelFilter::Trace))
        .build(Root::builder().appender("app").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}

/// Configure logging globally for the process. If log4rs is already initialized, replaces the config.
pub fn configure_logging(dir: Option<&std::path::Path>, level: Option<&str>, retention: Option<usize>) {
    use log::LevelFilter;
    use log4rs::append::rolling_file::RollingFileAppender;
    use log4rs::append::rolling_file::policy::compound::{
        CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
    };
    use log4rs::config::{Appender, Config, Logger, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use std::path::PathBuf;

    let base = dir.map(PathBuf::from).unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let keep = retention.unwrap_or(7) as u32;
    let lvl = match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
    let Ok(app_roller) = FixedWindowRoller::builder().build(&format!("{}", base.join("app.{}.log").display()), keep)
    else {
        return;
    };
    let app_policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(app_roller));
    let Ok(app_appender) =
        RollingFileAppender::builder().encoder(Box::new(PatternEncoder::new(pattern))).build(base.join("app.log"), Box::new(app_policy))
    else {
        return;
    };
    let Ok(diag_roller) =
        FixedWindowRoller::builder().build(&format!("{}", base.join("diagnostics.{}.log").display()), keep)
    else {
        return;
    };
    let diag_policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(diag_roller));
    let Ok(diag_appender) = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(base.join("diagnostics.log"), Box::new(diag_policy))
    else {
        return;
    };
    let Ok(config) = Config::builder()
        .appender(Appender::builder().build("app", Box::new(app_appender)))
        .appender(Appender::builder().build("diagnostics", Box::new(diag_appender)))
        .logger(Logger::builder().appender("diagnostics").additive(false).build("wax::dev6", LevelFilter::Trace))
        .build(Root::builder().appender("app").build(lvl))
    else {
        return;
    };
    let _ = log4rs::init_config(config);
}

/// Configure logging from environment variables if present:
/// - `WAX_LOG_DIR`, `WAX_LOG_LEVEL`, `WAX_LOG_RETENTION`
pub fn configure_from_env() {
    let dir = std::env::var("WAX_LOG_DIR").ok().map(std::path::PathBuf::from);
    let level = std::env::var("WAX_LOG_LEVEL").ok();
    let retention = std::env::var("WAX_LOG_RETENTION").ok().and_then(|s| s.parse::<usize>().ok());
    configure_logging(dir.as_deref(), level.as_deref(), retention);
}
