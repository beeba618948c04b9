use std::{
    env,
    fmt::Debug,
    io,
    str::FromStr,
};

use tracing::Level;
use tracing_subscriber::{
    fmt::{
        format::format,
        MakeWriter,
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Call this from services at startup.
pub fn config_service() {
    config_tracing(io::stdout, Level::INFO)
}

/// Call this from scripts and tools at startup.
pub fn config_tool() {
    config_tracing(io::stderr, Level::ERROR)
}

/// Call this at the top of tests that want log output. Safe to call more than
/// once.
pub fn config_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

fn config_tracing<W>(writer: W, level: Level)
where
    W: Send + Sync + for<'writer> MakeWriter<'writer> + 'static,
{
    let color_disabled = std::env::var("NO_COLOR").is_ok();
    let format_layer = tracing_subscriber::fmt::layer()
        .with_ansi(!color_disabled)
        .with_writer(writer);
    let format_layer = match std::env::var("LOG_FORMAT") {
        Ok(s) if s == "json" => format_layer.event_format(format().json()).boxed(),
        Ok(s) if s == "pretty" => format_layer.event_format(format().pretty()).boxed(),
        _ => format_layer.event_format(format().compact()).boxed(),
    };
    let format_layer = format_layer.with_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str())),
    );
    tracing_subscriber::registry().with(format_layer).init();
}
