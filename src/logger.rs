use std::{
    cell::RefCell,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use futures_core::{Stream, ready};
use pin_project_lite::pin_project;

use actix_http::{BoxedPayloadStream, Payload, error::PayloadError};
use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::HttpMessage;
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::{Error, Result};

use crate::facade::FileLogger;
use crate::record::{Capture, ErrorDetail, LogRecord, RequestDetail, RequestId, ResponseDetail, Snapshot};
use crate::severity::Severity;

/// Middleware writing access and error records of every request to the
/// severity files of a [`FileLogger`].
///
/// Per request it:
/// - installs a [`Logger`](crate::Logger) facade in the request extensions;
/// - writes a [`Severity::Verbose`] access record once the response body is
///   finished, unless auto-capture is off or the URL is excluded. With
///   `record_body` the record carries the request payload the handler read
///   and the response body, each cut at `max_body_bytes`;
/// - writes a [`Severity::Error`] record when the inner service fails or
///   returns an error response. The error itself is passed on unchanged.
///
/// # Examples
/// ```rust,no_run
/// use actix_web::App;
/// use actix_web_middleware_flogger::{FLogger, FileLogger, Options};
///
/// let logger = FileLogger::new(Options::new().app_name("shop")).unwrap();
/// let app = App::new()
///     .wrap(FLogger::new(logger.clone()));
/// ```
pub struct FLogger(Rc<Inner>);

#[derive(Debug, Clone)]
struct Inner {
    logger: FileLogger,
}

impl FLogger {
    /// Create `FLogger` middleware writing through `logger`.
    pub fn new(logger: FileLogger) -> FLogger {
        FLogger(Rc::new(Inner { logger }))
    }
}

impl<S, B> Transform<S, ServiceRequest> for FLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Transform = FLoggerMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(FLoggerMiddlewareService {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

fn capture_prefix(buf: &mut BytesMut, chunk: &Bytes, limit: usize) {
    let room = limit.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

/// Request payload seen so far by the handler.
type TappedBody = Rc<RefCell<BytesMut>>;

pin_project! {
    /// Request payload that copies what the handler reads into a buffer.
    struct PayloadTap {
        #[pin]
        payload: Payload,
        captured: TappedBody,
        limit: usize,
    }
}

impl Stream for PayloadTap {
    type Item = Result<Bytes, PayloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.payload.poll_next(cx));
        if let Some(Ok(chunk)) = &item {
            capture_prefix(&mut this.captured.borrow_mut(), chunk, *this.limit);
        }
        Poll::Ready(item)
    }
}

fn tap_payload(req: &mut ServiceRequest, limit: usize) -> TappedBody {
    let captured = TappedBody::default();
    let tap: BoxedPayloadStream = Box::pin(PayloadTap {
        payload: req.take_payload(),
        captured: Rc::clone(&captured),
        limit,
    });
    req.set_payload(Payload::Stream { payload: tap });
    captured
}

fn request_with_body(ctx: &Snapshot, body: Option<&TappedBody>) -> RequestDetail {
    let mut request = ctx.request.clone();
    if let Some(body) = body {
        request.set_body(&body.borrow());
    }
    request
}

/// Access record waiting for the response body to finish.
struct PendingAccess {
    logger: FileLogger,
    request: RequestDetail,
    response: ResponseDetail,
    start: Instant,
    body: Option<BytesMut>,
    body_limit: usize,
}

impl PendingAccess {
    fn capture(&mut self, chunk: &Bytes) {
        if let Some(body) = &mut self.body {
            capture_prefix(body, chunk, self.body_limit);
        }
    }

    fn finish(self, size: usize) {
        let PendingAccess {
            logger,
            request,
            mut response,
            start,
            body,
            ..
        } = self;
        response.size = Some(size);
        if let Some(body) = body {
            response.set_body(&body);
        }
        let ctx = Snapshot {
            request,
            response: Some(response),
        };
        let record = LogRecord::from_context(
            &ctx,
            Capture {
                response_time: Some(start.elapsed()),
                verbose_detail: true,
                ..Default::default()
            },
        );
        logger.write(Severity::ACCESS, record);
    }
}

pin_project! {
    pub struct StreamLog<B> {
        #[pin]
        body: B,
        access: Option<PendingAccess>,
        size: usize,
    }

    impl<B> PinnedDrop for StreamLog<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(access) = this.access.take() {
                access.finish(*this.size);
            }
        }
    }
}

impl<B: MessageBody> MessageBody for StreamLog<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.size += chunk.len();
                if let Some(access) = this.access {
                    access.capture(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

/// Logger middleware service.
pub struct FLoggerMiddlewareService<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for FLoggerMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Future = FLoggerResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let start = Instant::now();
        let logger = &self.inner.logger;
        let config = logger.config();

        let id = RequestId::from_request(req.request());
        let ctx = Arc::new(Snapshot {
            request: RequestDetail::from_request(req.request(), &id),
            response: None,
        });
        req.extensions_mut().insert(id);
        req.extensions_mut().insert(logger.bind(Arc::clone(&ctx)));

        let url = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| req.path());
        let capture = config.automate() && !config.exclude().is_excluded(req.path(), url);
        let request_body =
            (capture && config.record_body()).then(|| tap_payload(&mut req, config.max_body_bytes()));

        FLoggerResponse {
            fut: self.service.call(req),
            start,
            ctx,
            capture,
            request_body,
            logger: logger.clone(),
            _phantom: PhantomData,
        }
    }
}

pin_project! {
    pub struct FLoggerResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        start: Instant,
        ctx: Arc<Snapshot>,
        capture: bool,
        request_body: Option<TappedBody>,
        logger: FileLogger,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for FLoggerResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<StreamLog<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let res = match ready!(this.fut.poll(cx)) {
            Ok(res) => res,
            Err(err) => {
                let ctx = Snapshot {
                    request: request_with_body(this.ctx, this.request_body.as_ref()),
                    response: None,
                };
                this.logger
                    .record_failure(&ctx, ErrorDetail::from_actix(&err), this.start.elapsed());
                return Poll::Ready(Err(err));
            }
        };
        let request = request_with_body(this.ctx, this.request_body.as_ref());

        let response = ResponseDetail::from_parts(res.status(), res.headers());

        if let Some(error) = res.response().error() {
            log::debug!("Error in response: {:?}", error);
            let ctx = Snapshot {
                request: request.clone(),
                response: Some(response.clone()),
            };
            this.logger
                .record_failure(&ctx, ErrorDetail::from_actix(error), this.start.elapsed());
        }

        let access = if *this.capture {
            let config = this.logger.config();
            Some(PendingAccess {
                logger: this.logger.clone(),
                request,
                response,
                start: *this.start,
                body: config.record_body().then(BytesMut::new),
                body_limit: config.max_body_bytes(),
            })
        } else {
            None
        };

        Poll::Ready(Ok(res.map_body(move |_, body| StreamLog {
            body,
            access,
            size: 0,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::testing::records;
    use actix_web::{
        App, HttpResponse,
        http::{StatusCode, header},
        rt::time::timeout,
        test::{self, TestRequest},
        web,
    };
    use std::time::Duration;

    fn file_logger(dir: &std::path::Path, options: Options) -> FileLogger {
        FileLogger::new(options.root(dir).console(false)).unwrap()
    }

    #[actix_web::test]
    async fn test_access_record() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new());
        let app = test::init_service(
            App::new()
                .wrap(FLogger::new(logger.clone()))
                .route("/api/items", web::get().to(|| async { "[1,2,3]" })),
        )
        .await;

        let req = TestRequest::get()
            .uri("/api/items?page=1")
            .insert_header(("x-request-id", "abc"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = test::read_body(res).await;
        assert_eq!(body, "[1,2,3]");

        let access = records(&logger, Severity::Verbose, 1);
        assert_eq!(access.len(), 1);
        let record = &access[0];
        let request = record.request.as_ref().unwrap();
        assert_eq!(request.id, "abc");
        assert_eq!(request.path, "/api/items");
        assert_eq!(request.query, "page=1");
        assert_eq!(request.body, None);
        let response = record.response.as_ref().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.status_message, "OK");
        assert_eq!(response.size, Some(7));
        assert_eq!(response.body, None);
        assert!(record.response_time_ms.is_some());
        assert!(record.error.is_none());
        assert!(records(&logger, Severity::Error, 0).is_empty());
    }

    #[actix_web::test]
    async fn test_record_body() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new().record_body(true).max_body_bytes(8));
        let app = test::init_service(
            App::new()
                .wrap(FLogger::new(logger.clone()))
                .route(
                    "/json",
                    web::get().to(|| async {
                        HttpResponse::Ok()
                            .insert_header((header::CONTENT_TYPE, "application/json"))
                            .body(r#"{"ok":1}"#)
                    }),
                )
                .route("/long", web::get().to(|| async { "0123456789abcdef" })),
        )
        .await;

        for uri in ["/json", "/long"] {
            let res = test::call_service(&app, TestRequest::get().uri(uri).to_request()).await;
            test::read_body(res).await;
        }

        let access = records(&logger, Severity::Verbose, 2);
        assert_eq!(access.len(), 2);
        let json = access[0].response.as_ref().unwrap();
        assert_eq!(json.content_type.as_deref(), Some("application/json"));
        assert_eq!(json.body, Some(serde_json::json!({"ok": 1})));
        let long = access[1].response.as_ref().unwrap();
        assert_eq!(long.body, Some(serde_json::json!("01234567")));
        assert_eq!(long.size, Some(16));
    }

    #[actix_web::test]
    async fn test_record_request_body() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new().record_body(true).max_body_bytes(16));
        let app = test::init_service(
            App::new().wrap(FLogger::new(logger.clone())).route(
                "/orders",
                web::post().to(|body: web::Bytes| async move {
                    HttpResponse::Ok().body(format!("{} bytes", body.len()))
                }),
            ),
        )
        .await;

        for payload in [r#"{"sku":"a-1"}"#, "quantity=12;note=leave-at-door"] {
            let req = TestRequest::post()
                .uri("/orders")
                .set_payload(payload)
                .to_request();
            let body = test::call_and_read_body(&app, req).await;
            // the handler still sees the whole payload
            assert_eq!(body, format!("{} bytes", payload.len()));
        }

        let access = records(&logger, Severity::Verbose, 2);
        assert_eq!(access.len(), 2);
        assert_eq!(
            access[0].request.as_ref().unwrap().body,
            Some(serde_json::json!({"sku": "a-1"}))
        );
        assert_eq!(
            access[1].request.as_ref().unwrap().body,
            Some(serde_json::json!("quantity=12;note"))
        );
    }

    #[actix_web::test]
    async fn test_excluded_and_disabled_capture() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new().exclude("/health"));
        let app = test::init_service(
            App::new()
                .wrap(FLogger::new(logger.clone()))
                .default_service(web::to(|| async { "ok" })),
        )
        .await;
        for uri in ["/style.css", "/health", "/redirect?to=/", "/api/items"] {
            let res = test::call_service(&app, TestRequest::get().uri(uri).to_request()).await;
            test::read_body(res).await;
        }
        // records of one severity are written in order, so the last request
        // shows that none of the earlier ones were queued
        let access = records(&logger, Severity::Verbose, 1);
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].request.as_ref().unwrap().path, "/api/items");

        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new().automate(false));
        let app = test::init_service(
            App::new()
                .wrap(FLogger::new(logger.clone()))
                .default_service(web::to(|| async { "ok" })),
        )
        .await;
        let res = test::call_service(&app, TestRequest::get().uri("/api").to_request()).await;
        test::read_body(res).await;
        logger.verbose("done");
        let access = records(&logger, Severity::Verbose, 1);
        assert_eq!(access.len(), 1);
        assert!(access[0].request.is_none());
    }

    #[actix_web::test]
    async fn test_error_response_is_recorded_and_passed_on() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new());
        let mut errors = logger.subscribe();
        let app = test::init_service(
            App::new().wrap(FLogger::new(logger.clone())).route(
                "/fail",
                web::get().to(|| async {
                    Err::<HttpResponse, _>(actix_web::error::ErrorBadRequest("boom"))
                }),
            ),
        )
        .await;

        let res = test::call_service(&app, TestRequest::get().uri("/fail").to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.response().error().unwrap().to_string(), "boom");
        test::read_body(res).await;

        let failures = records(&logger, Severity::Error, 1);
        assert_eq!(failures.len(), 1);
        let failure = &failures[0];
        assert_eq!(failure.error.as_ref().unwrap().message, "boom");
        assert_eq!(failure.request.as_ref().unwrap().path, "/fail");
        assert_eq!(failure.response.as_ref().unwrap().status_code, 400);

        let event = errors.try_recv().unwrap();
        assert_eq!(event.error.message, "boom");
        assert_eq!(event.request.unwrap().path, "/fail");

        // the request still completed, so it is also an access record
        assert_eq!(records(&logger, Severity::Verbose, 1).len(), 1);
    }

    #[actix_web::test]
    async fn test_service_failure_is_recorded_once_and_reraised() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new());
        let mut errors = logger.subscribe();
        let app = test::init_service(
            App::new()
                .wrap_fn(|_, _| async {
                    Err::<ServiceResponse, Error>(actix_web::error::ErrorInternalServerError(
                        "boom",
                    ))
                })
                .wrap(FLogger::new(logger.clone()))
                .route("/api/items", web::get().to(|| async { "unreachable" })),
        )
        .await;

        let req = TestRequest::get().uri("/api/items").to_request();
        let err = app.call(req).await.err().unwrap();
        assert_eq!(err.to_string(), "boom");

        let failures = records(&logger, Severity::Error, 1);
        assert_eq!(failures.len(), 1);
        let failure = &failures[0];
        assert_eq!(failure.error.as_ref().unwrap().message, "boom");
        assert_eq!(failure.request.as_ref().unwrap().path, "/api/items");
        assert!(failure.response.is_none());
        assert_eq!(errors.try_recv().unwrap().error.message, "boom");

        logger.verbose("done");
        let access = records(&logger, Severity::Verbose, 1);
        assert_eq!(access.len(), 1);
        assert!(access[0].request.is_none());
    }

    #[actix_web::test]
    async fn test_busy_sink_does_not_hold_the_response() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new());
        let app = test::init_service(
            App::new().wrap(FLogger::new(logger.clone())).route(
                "/fail",
                web::get().to(|| async {
                    Err::<HttpResponse, _>(actix_web::error::ErrorBadRequest("boom"))
                }),
            ),
        )
        .await;

        let error_file = logger.sinks().hold(Severity::Error);
        let access_file = logger.sinks().hold(Severity::Verbose);
        let answered = timeout(Duration::from_secs(2), async {
            let res =
                test::call_service(&app, TestRequest::get().uri("/fail").to_request()).await;
            let status = res.status();
            test::read_body(res).await;
            status
        })
        .await;
        assert_eq!(answered.ok(), Some(StatusCode::BAD_REQUEST));
        drop(error_file);
        drop(access_file);

        assert_eq!(records(&logger, Severity::Error, 1).len(), 1);
        assert_eq!(records(&logger, Severity::Verbose, 1).len(), 1);
    }

    #[actix_web::test]
    async fn test_facade_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let logger = file_logger(dir.path(), Options::new().automate(false));
        let app = test::init_service(
            App::new().wrap(FLogger::new(logger.clone())).route(
                "/",
                web::get().to(|log: crate::Logger| async move {
                    log.info("inside handler");
                    HttpResponse::NoContent().finish()
                }),
            ),
        )
        .await;

        let res = test::call_service(&app, TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let info = records(&logger, Severity::Info, 1);
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].message, Some(serde_json::json!("inside handler")));
        assert!(info[0].request.is_none());
    }
}
