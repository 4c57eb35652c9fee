use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    /// `RUST_LOG`-style filter directives; `RUST_LOG` itself wins when set.
    pub filter: String,
    pub json: bool,
    /// Base directory for log files; `<base>/<component>/<component>.log`.
    pub log_dir_base: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            log_dir_base: Some(PathBuf::from("/var/log")),
        }
    }
}

impl TracingConfig {
    pub fn local_dev() -> Self {
        Self {
            filter: "debug".to_string(),
            json: false,
            log_dir_base: None,
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "filter: {}, json: {}, log dir base: {:?}",
            self.filter, self.json, self.log_dir_base
        )
    }
}

/// Initializes the subscriber: human-readable output on stderr, plus a
/// file sink under the configured base directory when it is writable,
/// falling back to `./logs/<component>/`. Log file setup failures are
/// reported and otherwise ignored.
pub fn init_tracing(config: &TracingConfig, component: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    type BaseSubscriber = Layered<EnvFilter, Registry>;
    type StderrLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync>;
    type FileLayer = Box<dyn Layer<Layered<StderrLayer, BaseSubscriber>> + Send + Sync>;

    let stderr_layer: StderrLayer = if config.json {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
    };

    let file_layer: Option<FileLayer> = config
        .log_dir_base
        .as_ref()
        .and_then(|base| open_log_file(base, component))
        .map(|file| {
            Box::new(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            ) as FileLayer
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

fn open_log_file(base: &PathBuf, component: &str) -> Option<std::fs::File> {
    let preferred = base.join(component);
    let fallback = PathBuf::from("./logs").join(component);

    for dir in [preferred, fallback] {
        if std::fs::create_dir_all(&dir).is_err() {
            continue;
        }
        let path = dir.join(format!("{component}.log"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => return Some(file),
            Err(err) => {
                eprintln!("Cannot open log file {}: {err}", path.display());
            }
        }
    }

    eprintln!("No writable log directory for {component}, logging to stderr only");
    None
}
