use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::row::Row;
use crate::shaper::ResultEvent;

/// What the listener hands to the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A runner result, still to be shaped.
    Event(ResultEvent),
    /// Rows already in sink shape.
    Rows(Vec<Row>),
}

#[derive(Clone, Copy)]
enum Route {
    Results,
    Rows,
}

fn response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::default());
    *resp.status_mut() = status;
    resp
}

/// Route, method, then body. The body must decode for its route.
async fn validate<B>(req: Request<B>) -> Result<Inbound, (StatusCode, String)>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    let route = match path.as_str() {
        "/v1/results" => Ok(Route::Results),
        "/v1/rows" => Ok(Route::Rows),
        _ => Err((StatusCode::NOT_FOUND, format!("unknown path: {path}"))),
    }
    .and_then(|route| {
        if method == Method::POST {
            Ok(route)
        } else {
            Err((StatusCode::METHOD_NOT_ALLOWED, format!("{method} {path}")))
        }
    })?;

    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("POST {path}: failed to read body")))?;

    let decoded = match route {
        Route::Results => serde_json::from_slice(&body).map(Inbound::Event),
        Route::Rows => serde_json::from_slice(&body).map(Inbound::Rows),
    };
    decoded.map_err(|e| (StatusCode::BAD_REQUEST, format!("POST {path}: {e}")))
}

async fn handle<B>(
    req: Request<B>,
    tx: mpsc::Sender<Inbound>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let inbound = match validate(req).await {
        Ok(inbound) => inbound,
        Err((status, reason)) => {
            tracing::warn!(reason, "ingest request rejected");
            return Ok(response(status));
        }
    };

    match tx.try_send(inbound) {
        Ok(()) => Ok(response(StatusCode::OK)),
        Err(TrySendError::Full(_)) => {
            let mut resp = response(StatusCode::SERVICE_UNAVAILABLE);
            resp.headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
            Ok(resp)
        }
        // Receiver gone means the exporter is shutting down.
        Err(TrySendError::Closed(_)) => Ok(response(StatusCode::BAD_GATEWAY)),
    }
}

/// Accept connections until `cancel` fires.
pub async fn serve(listener: TcpListener, tx: mpsc::Sender<Inbound>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let tx = tx.clone();
                        handle(req, tx)
                    });
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}
