//! A read-only HTML dump of the service table, ported from the original's
//! `debug.go`. Serves at [`crate::codec::DEFAULT_DEBUG_PATH`]; purely for a
//! human glancing at a running server, never exercised by a client.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;

use crate::service::ServiceTable;

fn render(table: &ServiceTable) -> String {
    let mut out = String::new();
    out.push_str("<html><body><title>GBankRPC Services</title>\n");
    for service in table.services() {
        let _ = write!(out, "<hr>\nService {}\n<hr>\n<table>\n", service.name);
        out.push_str("<th align=center>Method</th><th align=center>Calls</th>\n");
        for method in service.methods() {
            let _ = write!(
                out,
                "<tr><td align=left>{}({}, {}) error</td><td align=center>{}</td></tr>\n",
                method.name(),
                method.arg_type(),
                method.reply_type(),
                method.call_count(),
            );
        }
        out.push_str("</table>\n");
    }
    out.push_str("</body></html>\n");
    out
}

async fn handle(
    table: Arc<ServiceTable>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if *req.method() != Method::GET {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::new()))
            .unwrap());
    }
    Ok(Response::new(Full::new(Bytes::from(render(&table)))))
}

/// Accepts connections on `listener`, serving the debug page on every one
/// until the listener errors.
pub async fn serve_debug(listener: TcpListener, table: Arc<ServiceTable>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| handle(Arc::clone(&table), req));
                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!(error = %e, "debug connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "debug accept failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;
    use serde::{Deserialize, Serialize};

    struct Foo;

    #[derive(Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    #[derive(Serialize, Default)]
    struct Reply(i64);

    #[tokio::test]
    async fn debug_page_lists_registered_methods_and_call_counts() {
        let table = Arc::new(ServiceTable::new());
        table
            .register(
                ServiceBuilder::new("Foo", Foo)
                    .method("Sum", |_h: Arc<Foo>, arg: Args| async move {
                        Ok::<_, String>(Reply(arg.num1 + arg.num2))
                    })
                    .build(),
            )
            .unwrap();

        let (_svc, method) = table.lookup("Foo.Sum").unwrap();
        let arg_bytes = crate::codec::encode(crate::codec::CodecId::Json, &Args { num1: 1, num2: 2 }).unwrap();
        method.invoke(crate::codec::CodecId::Json, &arg_bytes).await.unwrap();

        let page = render(&table);
        assert!(page.contains("Service Foo"));
        assert!(page.contains("Sum"));
        assert!(page.contains("<td align=center>1</td>"));
    }
}
