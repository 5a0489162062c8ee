use std::{error::Error as StdError, panic::Location, path::PathBuf, sync::Arc, time::Duration};

use actix_utils::future::{Ready, ready};
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpMessage, HttpRequest};
use serde::Serialize;

use crate::config::{Config, Options};
use crate::error::SetupError;
use crate::notify::{ErrorChannel, ErrorEvent, ErrorSubscription};
use crate::record::{Capture, ErrorDetail, LogRecord, Snapshot, handle_message};
use crate::severity::Severity;
use crate::sink::SinkManager;

/// Resolved configuration, sinks and error channel shared by every request.
///
/// Build it once and hand clones to each worker's [`FLogger`](crate::FLogger),
/// so all workers append through the same file handles.
#[derive(Debug, Clone)]
pub struct FileLogger(Arc<Shared>);

#[derive(Debug)]
struct Shared {
    config: Config,
    sinks: SinkManager,
    errors: ErrorChannel,
}

impl FileLogger {
    /// Resolves `options`, prepares the output directory and opens one file
    /// per severity.
    pub fn new(options: Options) -> Result<Self, SetupError> {
        let config = options.resolve()?;
        let sinks = SinkManager::new(&config)?;
        Ok(FileLogger(Arc::new(Shared {
            config,
            sinks,
            errors: ErrorChannel::new(),
        })))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.0.errors
    }

    /// Subscribes to errors logged through this logger.
    pub fn subscribe(&self) -> ErrorSubscription {
        self.0.errors.subscribe()
    }

    /// File currently written for `severity`.
    pub fn path(&self, severity: Severity) -> PathBuf {
        self.0.sinks.path(severity)
    }

    #[cfg(test)]
    pub(crate) fn sinks(&self) -> &SinkManager {
        &self.0.sinks
    }

    /// Queues a prepared record for its severity file.
    pub fn write(&self, severity: Severity, record: LogRecord) {
        self.0.sinks.write(severity, record);
    }

    /// Logging facade not bound to any request.
    pub fn facade(&self) -> Logger {
        Logger {
            logger: self.clone(),
            context: None,
        }
    }

    pub(crate) fn bind(&self, context: Arc<Snapshot>) -> Logger {
        Logger {
            logger: self.clone(),
            context: Some(context),
        }
    }

    /// Writes an error record for a request that failed in the middleware
    /// and publishes it.
    pub(crate) fn record_failure(&self, ctx: &Snapshot, error: ErrorDetail, elapsed: Duration) {
        let record = LogRecord::from_context(
            ctx,
            Capture {
                error: Some(error.clone()),
                response_time: Some(elapsed),
                verbose_detail: true,
                ..Default::default()
            },
        );
        self.write(Severity::FAILURE, record);
        self.0.errors.emit(ErrorEvent {
            error,
            request: Some(ctx.request.clone()),
        });
    }

    pub fn log<M: Serialize + ?Sized>(&self, severity: Severity, message: &M) {
        self.facade().log(severity, message);
    }

    pub fn warn<M: Serialize + ?Sized>(&self, message: &M) {
        self.facade().warn(message);
    }

    pub fn info<M: Serialize + ?Sized>(&self, message: &M) {
        self.facade().info(message);
    }

    pub fn verbose<M: Serialize + ?Sized>(&self, message: &M) {
        self.facade().verbose(message);
    }

    #[track_caller]
    pub fn error<E, M>(&self, err: &E, message: &M)
    where
        E: StdError + ?Sized,
        M: Serialize + ?Sized,
    {
        self.facade().error(err, message);
    }

    #[track_caller]
    pub fn error_only<E: StdError + ?Sized>(&self, err: &E) {
        self.facade().error_only(err);
    }
}

/// Logging facade handed to application code.
///
/// Inside a request it is extracted like any other argument:
///
/// ```rust
/// use actix_web::HttpResponse;
/// use actix_web_middleware_flogger::Logger;
///
/// async fn checkout(logger: Logger) -> HttpResponse {
///     logger.info("checkout started");
///     logger.warn(&serde_json::json!({ "cart": 12, "stock": "low" }));
///     HttpResponse::Ok().finish()
/// }
/// ```
///
/// Records written through it carry the message and error only; the request
/// itself is attached to published [`ErrorEvent`]s.
#[derive(Debug, Clone)]
pub struct Logger {
    logger: FileLogger,
    context: Option<Arc<Snapshot>>,
}

impl Logger {
    fn emit(&self, severity: Severity, capture: Capture) {
        let record = match &self.context {
            Some(ctx) if self.logger.config().framework_bound() => {
                LogRecord::from_context(ctx, capture)
            }
            _ => LogRecord::from_default(capture),
        };
        self.logger.write(severity, record);
    }

    /// Writes `message` at `severity`.
    pub fn log<M: Serialize + ?Sized>(&self, severity: Severity, message: &M) {
        self.emit(
            severity,
            Capture {
                message: handle_message(message),
                ..Default::default()
            },
        );
    }

    pub fn warn<M: Serialize + ?Sized>(&self, message: &M) {
        self.log(Severity::Warn, message);
    }

    pub fn info<M: Serialize + ?Sized>(&self, message: &M) {
        self.log(Severity::Info, message);
    }

    pub fn verbose<M: Serialize + ?Sized>(&self, message: &M) {
        self.log(Severity::Verbose, message);
    }

    /// Writes `err` and `message` at [`Severity::Error`] and publishes the
    /// error on the logger's [`ErrorChannel`].
    #[track_caller]
    pub fn error<E, M>(&self, err: &E, message: &M)
    where
        E: StdError + ?Sized,
        M: Serialize + ?Sized,
    {
        let error = ErrorDetail::from_error(err).with_location(Location::caller());
        self.capture_error(error, handle_message(message));
    }

    /// Like [`Logger::error`], without a message.
    #[track_caller]
    pub fn error_only<E: StdError + ?Sized>(&self, err: &E) {
        let error = ErrorDetail::from_error(err).with_location(Location::caller());
        self.capture_error(error, None);
    }

    fn capture_error(&self, error: ErrorDetail, message: Option<serde_json::Value>) {
        self.emit(
            Severity::Error,
            Capture {
                error: Some(error.clone()),
                message,
                ..Default::default()
            },
        );
        let request = self
            .context
            .as_ref()
            .filter(|_| self.logger.config().framework_bound())
            .map(|ctx| ctx.request.clone());
        self.logger.errors().emit(ErrorEvent { error, request });
    }
}

impl FromRequest for Logger {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(req.extensions().get::<Logger>().cloned().ok_or_else(|| {
            actix_web::error::ErrorInternalServerError("FLogger middleware is not installed")
        }))
    }
}
