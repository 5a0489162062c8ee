//! Actix-web middleware writing request logs to daily rotated files, one file
//! per severity.
//!
//! Every completed request becomes an access record in the `verbose` file and
//! every failed request an error record in the `error` file. Handlers get a
//! [`Logger`] facade to write their own `warn`, `info`, `verbose` and `error`
//! records next to them.
//!
//! # Examples
//! ```rust,no_run
//! use actix_web::{web, App, HttpResponse, HttpServer};
//! use actix_web_middleware_flogger::{FLogger, FileLogger, Logger, Options};
//!
//! async fn index(logger: Logger) -> HttpResponse {
//!     logger.info("index visited");
//!     HttpResponse::Ok().body("Hello world!")
//! }
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let logger = FileLogger::new(
//!         Options::new()
//!             .app_name("shop")
//!             .max_files("14d")
//!             .max_size("20m"),
//!     )
//!     .map_err(std::io::Error::other)?;
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(FLogger::new(logger.clone()))
//!             .route("/", web::get().to(index))
//!     })
//!     .bind("127.0.0.1:8080")?;
//!     Ok(())
//! }
//! ```
//!
//! # File layout
//!
//! Records are JSON lines in `{root}/{app_name}/{file_name}.{severity}-{date}.log`.
//! A file rolls over when the date pattern yields a new value or when it
//! grows past `max_size`; files beyond `max_files` (a count, or an age such as
//! `"30d"`) are deleted.
//!
//! # Environment
//!
//! [`Environment::Development`] and [`Environment::Production`] write under
//! `/data/logs` and keep the console quiet. Any other environment writes
//! under `./logs` and echoes every record to stdout in color. When the root
//! cannot be created the logger warns and falls back to `./logs`.
//!
//! # Error notifications
//!
//! Errors written at the `error` severity are also published on the logger's
//! [`ErrorChannel`], see [`FileLogger::subscribe`].
//!
//! # Diagnostics
//!
//! Problems of the logger itself (unwritable files, failed clean-up) are
//! printed to stderr and also sent through the `log` crate, so any `log`
//! backend picks them up:
//!
//! ```rust
//! use structured_logger::{Builder, async_json::new_writer};
//!
//! Builder::new()
//!     .with_target_writer("*", new_writer(tokio::io::stderr()))
//!     .init();
//! ```

mod config;
mod console;
mod error;
mod facade;
mod logger;
mod notify;
mod record;
mod rolling;
mod severity;
mod sink;
#[cfg(test)]
mod testing;

pub use crate::config::{
    Config, ConsoleEcho, Environment, LOCAL_ROOT, Limit, Options, Retention, RotateOptions,
    RotationPolicy, SERVE_ROOT, parse_size,
};
pub use crate::error::SetupError;
pub use crate::facade::{FileLogger, Logger};
pub use crate::logger::{FLogger, FLoggerMiddlewareService, FLoggerResponse, StreamLog};
pub use crate::notify::{ErrorChannel, ErrorEvent, ErrorSubscription};
pub use crate::record::{
    Capture, ErrorDetail, ExcludeFilter, LogRecord, RequestDetail, RequestId, ResponseDetail,
    Snapshot, handle_error, handle_message, humanize_duration, timestamp,
};
pub use crate::severity::{Descriptor, Severity, UnknownSeverity};
pub use crate::sink::SinkManager;
