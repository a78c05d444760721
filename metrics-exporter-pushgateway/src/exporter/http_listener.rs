use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1::Builder as HyperHttpBuilder,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ExporterFuture;
use crate::common::BuildError;
use crate::formatting;
use crate::registry::Gatherer;

struct HttpListeningExporter {
    inner: Arc<Inner>,
}

struct Inner {
    gatherer: Arc<dyn Gatherer>,
    path: String,
}

impl HttpListeningExporter {
    async fn serve(
        &self,
        listener: std::net::TcpListener,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), super::ExporterError> {
        let listener = TcpListener::from_std(listener)?;

        loop {
            let stream = tokio::select! {
                _ = &mut shutdown => {
                    debug!("shutting down HTTP listener");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Error accepting connection. Ignoring request. Error: {:?}", e);
                        continue;
                    }
                },
            };

            self.process_stream(stream);
        }
    }

    fn process_stream(&self, stream: TcpStream) {
        let inner = self.inner.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let inner = inner.clone();
            async move { Ok::<_, hyper::Error>(Self::handle_http_request(&inner, &req)) }
        });

        tokio::task::spawn(async move {
            if let Err(err) =
                HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await
            {
                warn!("Error serving connection. Error: {:?}", err);
            };
        });
    }

    fn handle_http_request(inner: &Inner, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        if path == inner.path {
            let output = formatting::render_families(&inner.gatherer.gather());
            let mut response = Response::new(Full::from(output));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(formatting::CONTENT_TYPE));
            response
        } else if path == "/health" {
            Response::new(Full::from("OK"))
        } else {
            Self::new_not_found_response()
        }
    }

    fn new_not_found_response() -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::<Bytes>::default());
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }
}

/// Creates an `ExporterFuture` serving the gathered metrics at `path`, until `shutdown` fires or
/// its sender is dropped.
///
/// Returns the address actually bound, which differs from `listen_address` when binding port 0.
///
/// ## Errors
///
/// Fails if it cannot bind to the listen address.
pub(crate) fn new_http_listener(
    gatherer: Arc<dyn Gatherer>,
    listen_address: SocketAddr,
    path: String,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, ExporterFuture), BuildError> {
    let listener = std::net::TcpListener::bind(listen_address)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .map_err(|e| BuildError::FailedToCreateHTTPListener(e.to_string()))?;
    let local_address = listener
        .local_addr()
        .map_err(|e| BuildError::FailedToCreateHTTPListener(e.to_string()))?;

    let exporter = HttpListeningExporter { inner: Arc::new(Inner { gatherer, path }) };

    Ok((local_address, Box::pin(async move { exporter.serve(listener, shutdown).await })))
}

#[cfg(test)]
mod tests {
    use hyper::StatusCode;

    use crate::exporter::http_listener::HttpListeningExporter;

    #[test]
    fn new_not_found_response_always_succeeds() {
        let response = HttpListeningExporter::new_not_found_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
